//! Deliverable generators for dealflow.
//!
//! Each generator turns a deal's attribute bag into structured deliverable
//! content. Financial figures are computed locally and deterministically;
//! only the prose sections come from the narrative collaborator.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use dealflow_core::capital::{build_capital_stack, CapitalStackInput, ReferenceRates};
use dealflow_core::error::DealflowError;
use dealflow_core::pipeline::{DeliverableGenerator, NarrativeClient};
use dealflow_core::types::Deal;
use serde_json::{json, Value};
use tracing::debug;

/// Map a deal's attribute bag onto a capital stack request.
///
/// Deal size comes from `asking_price`, falling back to `capital_need` and
/// then `acquisition_budget`; earnings prefer `ebitda` over `sde`.
pub fn capital_input_for_deal(deal: &Deal) -> CapitalStackInput {
    let deal_size = deal
        .numeric_attribute("asking_price")
        .or_else(|| deal.numeric_attribute("capital_need"))
        .or_else(|| deal.numeric_attribute("acquisition_budget"))
        .map(|v| v.max(0.0) as u64)
        .unwrap_or(0);

    let mut input = CapitalStackInput::new(deal_size);
    input.earnings_minor = deal
        .numeric_attribute("ebitda")
        .or_else(|| deal.numeric_attribute("sde"))
        .map(|v| v.max(0.0) as u64);
    input.credit_score = deal
        .numeric_attribute("credit_score")
        .map(|v| v.clamp(0.0, u16::MAX as f64) as u16);
    input.us_citizen_or_resident = deal
        .attributes
        .get("us_citizen_or_resident")
        .and_then(Value::as_bool);
    input.available_equity_minor = deal
        .numeric_attribute("available_equity")
        .map(|v| v.max(0.0) as u64);
    input.includes_real_estate = deal
        .attributes
        .get("includes_real_estate")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    input.seller_note_open = deal
        .attributes
        .get("seller_note_open")
        .and_then(Value::as_bool);
    input.industry = deal.string_attribute("industry").map(str::to_string);
    input
}

/// Generates a financing-structure deliverable from the capital stack tree.
#[derive(Debug, Clone)]
pub struct CapitalStackGenerator {
    rates: ReferenceRates,
}

impl CapitalStackGenerator {
    pub fn new(rates: ReferenceRates) -> Self {
        Self { rates }
    }
}

impl Default for CapitalStackGenerator {
    fn default() -> Self {
        Self::new(ReferenceRates::default())
    }
}

#[async_trait]
impl DeliverableGenerator for CapitalStackGenerator {
    fn slug(&self) -> &str {
        "capital_stack"
    }

    async fn generate(
        &self,
        deal: &Deal,
        narrative: &dyn NarrativeClient,
    ) -> Result<Value, DealflowError> {
        let input = capital_input_for_deal(deal);
        if input.deal_size_minor == 0 {
            return Err(DealflowError::Generation(
                "deal has no usable size attribute (asking_price, capital_need, or acquisition_budget)"
                    .to_string(),
            ));
        }

        let stack = build_capital_stack(&input, &self.rates);
        debug!(
            deal_id = %deal.deal_id,
            tier = stack.tier.name(),
            layers = stack.layers.len(),
            "capital stack modeled"
        );

        let layer_summary: Vec<String> = stack
            .layers
            .iter()
            .map(|layer| format!("{}: {} minor units", layer.name, layer.amount_minor))
            .collect();
        let prompt = format!(
            "Summarize a {} financing structure for a deal of {} minor units. Layers: {}.",
            stack.tier.name(),
            stack.deal_size_minor,
            layer_summary.join("; ")
        );
        let summary = narrative.generate(&prompt).await?;

        Ok(json!({
            "kind": "capital_stack",
            "stack": stack,
            "summary": summary,
            "generated_at": Utc::now(),
        }))
    }
}

/// Earnings multiples by league position, low and high bound, in tenths.
/// Premium industries shift the band up one notch.
const VALUATION_MULTIPLES_TENTHS: (u32, u32) = (25, 40);
const PREMIUM_SHIFT_TENTHS: u32 = 10;

/// Generates a valuation-report deliverable from an earnings-multiple band.
#[derive(Debug, Clone, Default)]
pub struct ValuationGenerator;

#[async_trait]
impl DeliverableGenerator for ValuationGenerator {
    fn slug(&self) -> &str {
        "valuation"
    }

    async fn generate(
        &self,
        deal: &Deal,
        narrative: &dyn NarrativeClient,
    ) -> Result<Value, DealflowError> {
        let earnings = deal
            .numeric_attribute("ebitda")
            .or_else(|| deal.numeric_attribute("sde"))
            .map(|v| v.max(0.0) as u64)
            .ok_or_else(|| {
                DealflowError::Generation(
                    "deal has no earnings attribute (ebitda or sde)".to_string(),
                )
            })?;

        let premium = deal
            .string_attribute("industry")
            .map(|industry| {
                let lowered = industry.to_ascii_lowercase();
                ["saas", "software", "technology", "fintech", "healthcare"]
                    .iter()
                    .any(|keyword| lowered.contains(keyword))
            })
            .unwrap_or(false);

        let (mut low_tenths, mut high_tenths) = VALUATION_MULTIPLES_TENTHS;
        if premium {
            low_tenths += PREMIUM_SHIFT_TENTHS;
            high_tenths += PREMIUM_SHIFT_TENTHS;
        }

        let low_minor = earnings.saturating_mul(low_tenths as u64) / 10;
        let high_minor = earnings.saturating_mul(high_tenths as u64) / 10;
        let midpoint_minor = (low_minor + high_minor) / 2;

        let prompt = format!(
            "Write a short valuation narrative for a business with earnings of {} minor units, valued between {} and {} minor units.",
            earnings, low_minor, high_minor
        );
        let summary = narrative.generate(&prompt).await?;

        Ok(json!({
            "kind": "valuation",
            "earnings_minor": earnings,
            "multiple_low": low_tenths as f64 / 10.0,
            "multiple_high": high_tenths as f64 / 10.0,
            "value_low_minor": low_minor,
            "value_high_minor": high_minor,
            "value_midpoint_minor": midpoint_minor,
            "premium_industry": premium,
            "summary": summary,
            "generated_at": Utc::now(),
        }))
    }
}

/// Fallback generator: a narrative-only document for any unrecognized slug.
#[derive(Debug, Clone, Default)]
pub struct NarrativeDocumentGenerator;

#[async_trait]
impl DeliverableGenerator for NarrativeDocumentGenerator {
    fn slug(&self) -> &str {
        "narrative_document"
    }

    async fn generate(
        &self,
        deal: &Deal,
        narrative: &dyn NarrativeClient,
    ) -> Result<Value, DealflowError> {
        let industry = deal.string_attribute("industry").unwrap_or("unspecified");
        let prompt = format!(
            "Draft a deal document for a {} business on the {} journey.",
            industry,
            deal.journey.name()
        );
        let body = narrative.generate(&prompt).await?;

        Ok(json!({
            "kind": "narrative_document",
            "journey": deal.journey.name(),
            "body": body,
            "generated_at": Utc::now(),
        }))
    }
}

/// Deterministic narrative collaborator for local runs and tests. Echoes a
/// canned sentence derived from the prompt instead of calling out.
#[derive(Debug, Clone, Default)]
pub struct StaticNarrativeClient;

#[async_trait]
impl NarrativeClient for StaticNarrativeClient {
    async fn generate(&self, prompt: &str) -> Result<String, DealflowError> {
        let head: String = prompt.chars().take(80).collect();
        Ok(format!("[draft] {head}"))
    }
}
