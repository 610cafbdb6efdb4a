use crate::error::DealflowError;
use crate::registry::{self, GateDefinition};
use crate::store::{ChargeSpec, CommitAdvance, DealStore};
use crate::types::{AdvanceOutcome, Deal, DealStatus, GateProgress, JourneyType};
use crate::wallet::{classify_league, price_for_gate};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Attribute keys the readiness check validates as numeric. A declared but
/// non-numeric value for one of these counts as missing rather than present,
/// so type confusion surfaces at the boundary instead of deep in a generator.
const NUMERIC_ATTRIBUTE_KEYS: &[&str] = &[
    "revenue",
    "ebitda",
    "sde",
    "asking_price",
    "capital_need",
    "acquisition_budget",
];

/// Required fields of `gate` that are absent from the deal's attribute bag.
///
/// A field is present when its value is non-null and non-empty; empty strings
/// and empty arrays count as missing. Pure, no side effects.
pub fn missing_fields(deal: &Deal, gate: &GateDefinition) -> Vec<String> {
    gate.required_fields
        .iter()
        .filter(|field| !field_present(deal, field))
        .map(|field| field.to_string())
        .collect()
}

fn field_present(deal: &Deal, field: &str) -> bool {
    let Some(value) = deal.attributes.get(field) else {
        return false;
    };
    if NUMERIC_ATTRIBUTE_KEYS.contains(&field) {
        return value.as_f64().is_some();
    }
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// Deal-size and earnings figures the pricing league is classified from.
fn pricing_inputs(deal: &Deal) -> (u64, Option<u64>, Option<&str>) {
    let size = deal
        .numeric_attribute("asking_price")
        .or_else(|| deal.numeric_attribute("capital_need"))
        .or_else(|| deal.numeric_attribute("acquisition_budget"))
        .map(|v| v.max(0.0) as u64)
        .unwrap_or(0);
    let earnings = deal
        .numeric_attribute("ebitda")
        .or_else(|| deal.numeric_attribute("sde"))
        .map(|v| v.max(0.0) as u64);
    (size, earnings, deal.string_attribute("industry"))
}

/// Drives deals through their journey's fixed gate sequence.
///
/// All race-sensitive work (the stale-gate check, the paywall debit, and the
/// gate persistence) is delegated to the store's single advance commit, so a
/// duplicate or concurrent advance can only settle once.
#[derive(Clone)]
pub struct GateEngine {
    store: DealStore,
}

impl GateEngine {
    pub fn new(store: DealStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DealStore {
        &self.store
    }

    /// Create a deal at the first gate of `journey`.
    pub async fn start_journey(
        &self,
        owner_id: &str,
        journey: JourneyType,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Deal, DealflowError> {
        let first = registry::first_gate(journey);
        let deal = Deal::new(owner_id, journey, first.id, attributes);
        self.store.insert_deal(&deal).await?;
        info!(
            deal_id = %deal.deal_id,
            journey = journey.name(),
            gate = first.id,
            "journey started"
        );
        Ok(deal)
    }

    pub async fn deal(&self, deal_id: &str) -> Result<Deal, DealflowError> {
        self.store.deal(deal_id).await
    }

    pub async fn update_attributes(
        &self,
        deal_id: &str,
        partial: BTreeMap<String, Value>,
    ) -> Result<Deal, DealflowError> {
        self.store.merge_attributes(deal_id, partial).await
    }

    pub async fn progress(&self, deal_id: &str) -> Result<Vec<GateProgress>, DealflowError> {
        self.store.gate_progress(deal_id).await
    }

    /// Attempt to advance a deal from `from_gate` to `to_gate`.
    ///
    /// `NotReady`, `PaymentRequired`, and `GateMismatch` are outcomes, not
    /// errors; in every one of them the deal is left exactly where it was and
    /// the call is retryable. Errors are reserved for unknown deals/gates,
    /// out-of-sequence targets, and storage failures.
    pub async fn advance(
        &self,
        deal_id: &str,
        from_gate: &str,
        to_gate: &str,
    ) -> Result<AdvanceOutcome, DealflowError> {
        let deal = self.store.deal(deal_id).await?;
        let journey = deal.journey;

        if deal.status == DealStatus::Closed {
            return Err(DealflowError::InvalidTransition {
                from: from_gate.to_string(),
                to: to_gate.to_string(),
                reason: "deal is closed".to_string(),
            });
        }

        let from = registry::gate(journey, from_gate)
            .ok_or_else(|| DealflowError::unknown_gate(journey.name(), from_gate))?;
        let to = registry::gate(journey, to_gate)
            .ok_or_else(|| DealflowError::unknown_gate(journey.name(), to_gate))?;

        // Gates only ever move one step forward in sequence.
        match registry::next_gate(journey, from.id) {
            Some(next) if next.id == to.id => {}
            _ => {
                return Err(DealflowError::InvalidTransition {
                    from: from.id.to_string(),
                    to: to.id.to_string(),
                    reason: format!("'{}' is not the successor of '{}'", to.id, from.id),
                });
            }
        }

        if deal.current_gate != from.id {
            debug!(deal_id, expected = from.id, actual = %deal.current_gate, "stale advance");
            return Ok(AdvanceOutcome::GateMismatch {
                expected: from.id.to_string(),
                actual: deal.current_gate,
            });
        }

        let missing = missing_fields(&deal, from);
        if !missing.is_empty() {
            debug!(deal_id, gate = from.id, ?missing, "advance blocked on readiness");
            return Ok(AdvanceOutcome::NotReady { missing });
        }

        let charge = if to.paywalled {
            let (size, earnings, industry) = pricing_inputs(&deal);
            let league = classify_league(size, earnings, industry);
            let price_minor = price_for_gate(to.base_price_minor, league);
            debug!(
                deal_id,
                gate = to.id,
                league = league.name(),
                price_minor,
                "paywalled gate priced"
            );
            Some((
                price_minor,
                ChargeSpec {
                    user_id: deal.owner_id.clone(),
                    amount_minor: price_minor,
                    description: format!("{} gate: {}", journey.name(), to.name),
                },
            ))
        } else {
            None
        };

        let price_minor = charge.as_ref().map(|(price, _)| *price);
        let charge = charge.map(|(_, charge)| charge);

        match self
            .store
            .commit_advance(deal_id, from.id, to.id, charge)
            .await?
        {
            CommitAdvance::Advanced => {
                info!(deal_id, from = from.id, to = to.id, "gate advanced");
                Ok(AdvanceOutcome::Advanced {
                    new_gate: to.id.to_string(),
                })
            }
            CommitAdvance::StaleGate { actual } => Ok(AdvanceOutcome::GateMismatch {
                expected: from.id.to_string(),
                actual,
            }),
            CommitAdvance::InsufficientFunds { balance_minor } => {
                // Unreachable for free gates; the store only reports a
                // shortfall when a charge was attached.
                Ok(AdvanceOutcome::PaymentRequired {
                    price_minor: price_minor.unwrap_or(0),
                    balance_minor,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::gates_for;
    use crate::types::GateProgressStatus;
    use serde_json::json;

    fn engine() -> GateEngine {
        GateEngine::new(DealStore::memory())
    }

    fn sell_side_attributes() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("industry".to_string(), json!("landscaping")),
            ("revenue".to_string(), json!(3_000_000)),
            ("ebitda".to_string(), json!(400_000)),
            ("asking_price".to_string(), json!(2_000_000)),
        ])
    }

    #[tokio::test]
    async fn paywalled_advance_debits_the_league_price() {
        let engine = engine();
        engine
            .store()
            .credit("user-1", 5_000, "top-up")
            .await
            .unwrap();
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, sell_side_attributes())
            .await
            .unwrap();

        let outcome = engine
            .advance(&deal.deal_id, "intake", "financial_profile")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Advanced {
                new_gate: "financial_profile".to_string()
            }
        );

        // A 2M main-street deal pays the base price unscaled.
        let outcome = engine
            .advance(&deal.deal_id, "financial_profile", "valuation")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Advanced {
                new_gate: "valuation".to_string()
            }
        );
        assert_eq!(engine.store().balance("user-1").await.unwrap(), 3_500);

        let txns = engine.store().transactions("user-1").await.unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[1].amount_minor, -1_500);
        assert_eq!(txns[1].deal_id.as_deref(), Some(deal.deal_id.as_str()));
    }

    #[tokio::test]
    async fn shortfall_leaves_the_deal_in_place() {
        let engine = engine();
        engine
            .store()
            .credit("user-1", 1_000, "top-up")
            .await
            .unwrap();
        let mut attributes = sell_side_attributes();
        // Sub-1M asking price keeps the deal in the base pricing league.
        attributes.insert("asking_price".to_string(), json!(900_000));
        attributes.insert("ebitda".to_string(), json!(150_000));
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, attributes)
            .await
            .unwrap();

        engine
            .advance(&deal.deal_id, "intake", "financial_profile")
            .await
            .unwrap();
        let outcome = engine
            .advance(&deal.deal_id, "financial_profile", "valuation")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::PaymentRequired {
                price_minor: 1_500,
                balance_minor: 1_000
            }
        );

        let reloaded = engine.deal(&deal.deal_id).await.unwrap();
        assert_eq!(reloaded.current_gate, "financial_profile");
        assert_eq!(engine.store().balance("user-1").await.unwrap(), 1_000);
        assert_eq!(
            engine.store().transactions("user-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn retried_advance_reports_mismatch_without_second_charge() {
        let engine = engine();
        engine
            .store()
            .credit("user-1", 10_000, "top-up")
            .await
            .unwrap();
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, sell_side_attributes())
            .await
            .unwrap();
        engine
            .advance(&deal.deal_id, "intake", "financial_profile")
            .await
            .unwrap();

        let first = engine
            .advance(&deal.deal_id, "financial_profile", "valuation")
            .await
            .unwrap();
        assert!(matches!(first, AdvanceOutcome::Advanced { .. }));

        let second = engine
            .advance(&deal.deal_id, "financial_profile", "valuation")
            .await
            .unwrap();
        assert_eq!(
            second,
            AdvanceOutcome::GateMismatch {
                expected: "financial_profile".to_string(),
                actual: "valuation".to_string(),
            }
        );

        let debits = engine
            .store()
            .transactions("user-1")
            .await
            .unwrap()
            .iter()
            .filter(|txn| txn.amount_minor < 0)
            .count();
        assert_eq!(debits, 1);
    }

    #[tokio::test]
    async fn concurrent_advances_settle_at_most_once() {
        let engine = engine();
        engine
            .store()
            .credit("user-1", 50_000, "top-up")
            .await
            .unwrap();
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, sell_side_attributes())
            .await
            .unwrap();
        engine
            .advance(&deal.deal_id, "intake", "financial_profile")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let engine = engine.clone();
            let deal_id = deal.deal_id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .advance(&deal_id, "financial_profile", "valuation")
                    .await
            }));
        }

        let mut advanced = 0;
        for handle in handles {
            if let AdvanceOutcome::Advanced { .. } = handle.await.unwrap().unwrap() {
                advanced += 1;
            }
        }
        assert_eq!(advanced, 1);

        let debits = engine
            .store()
            .transactions("user-1")
            .await
            .unwrap()
            .iter()
            .filter(|txn| txn.amount_minor < 0)
            .count();
        assert_eq!(debits, 1);
    }

    #[tokio::test]
    async fn missing_fields_block_the_advance() {
        let engine = engine();
        let deal = engine
            .start_journey(
                "user-1",
                JourneyType::SellSide,
                BTreeMap::from([
                    ("industry".to_string(), json!("manufacturing")),
                    ("revenue".to_string(), json!(1_000_000)),
                    // Non-numeric value for a numeric key counts as missing.
                    ("ebitda".to_string(), json!("unknown")),
                ]),
            )
            .await
            .unwrap();
        engine
            .advance(&deal.deal_id, "intake", "financial_profile")
            .await
            .unwrap();

        let outcome = engine
            .advance(&deal.deal_id, "financial_profile", "valuation")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::NotReady {
                missing: vec!["ebitda".to_string(), "asking_price".to_string()]
            }
        );
        let reloaded = engine.deal(&deal.deal_id).await.unwrap();
        assert_eq!(reloaded.current_gate, "financial_profile");
    }

    #[tokio::test]
    async fn skipping_a_gate_is_rejected() {
        let engine = engine();
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, sell_side_attributes())
            .await
            .unwrap();

        let err = engine
            .advance(&deal.deal_id, "intake", "valuation")
            .await
            .unwrap_err();
        assert!(matches!(err, DealflowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn gates_advance_through_the_full_sequence_in_order() {
        let engine = engine();
        engine
            .store()
            .credit("user-1", 100_000, "top-up")
            .await
            .unwrap();
        let mut attributes = sell_side_attributes();
        attributes.insert("business_summary".to_string(), json!("A tidy shop."));
        let deal = engine
            .start_journey("user-1", JourneyType::SellSide, attributes)
            .await
            .unwrap();

        let gates = gates_for(JourneyType::SellSide);
        let mut visited = vec![gates[0].id.to_string()];
        for pair in gates.windows(2) {
            let outcome = engine
                .advance(&deal.deal_id, pair[0].id, pair[1].id)
                .await
                .unwrap();
            match outcome {
                AdvanceOutcome::Advanced { new_gate } => visited.push(new_gate),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        let expected: Vec<String> = gates.iter().map(|g| g.id.to_string()).collect();
        assert_eq!(visited, expected);

        let progress = engine.progress(&deal.deal_id).await.unwrap();
        let completed = progress
            .iter()
            .filter(|p| p.status == GateProgressStatus::Completed)
            .count();
        assert_eq!(completed, gates.len() - 1);
        assert!(progress
            .iter()
            .filter(|p| p.status == GateProgressStatus::Completed)
            .all(|p| p.completed_at.is_some()));
    }
}
