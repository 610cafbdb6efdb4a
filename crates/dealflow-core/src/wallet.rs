use crate::types::WalletTransaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse deal classification used to scale paywall pricing.
///
/// Ordered from smallest to largest; ordering is meaningful for promotion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum League {
    MainStreet,
    Growth,
    LowerMiddle,
    MiddleMarket,
    UpperMiddle,
    Institutional,
}

impl League {
    /// Price multiplier in basis points of the base gate price.
    pub fn multiplier_bps(self) -> u64 {
        match self {
            Self::MainStreet => 10_000,
            Self::Growth => 12_500,
            Self::LowerMiddle => 15_000,
            Self::MiddleMarket => 20_000,
            Self::UpperMiddle => 25_000,
            Self::Institutional => 30_000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MainStreet => "main_street",
            Self::Growth => "growth",
            Self::LowerMiddle => "lower_middle",
            Self::MiddleMarket => "middle_market",
            Self::UpperMiddle => "upper_middle",
            Self::Institutional => "institutional",
        }
    }

    fn promoted(self) -> Self {
        match self {
            Self::MainStreet => Self::Growth,
            Self::Growth => Self::LowerMiddle,
            Self::LowerMiddle => Self::MiddleMarket,
            Self::MiddleMarket => Self::UpperMiddle,
            Self::UpperMiddle | Self::Institutional => Self::Institutional,
        }
    }
}

/// Industries that historically transact at premium multiples. A keyword hit
/// promotes the computed league by one tier for pricing purposes only;
/// capital stack tier routing stays driven by deal size alone.
const PREMIUM_INDUSTRY_KEYWORDS: &[&str] = &[
    "saas",
    "software",
    "technology",
    "fintech",
    "healthcare",
    "medical",
    "pharma",
    "aerospace",
    "defense",
];

fn league_for_size(size_minor: u64) -> League {
    match size_minor {
        0..=4_999_999 => League::MainStreet,
        5_000_000..=24_999_999 => League::Growth,
        25_000_000..=99_999_999 => League::LowerMiddle,
        100_000_000..=249_999_999 => League::MiddleMarket,
        250_000_000..=999_999_999 => League::UpperMiddle,
        _ => League::Institutional,
    }
}

/// Classify a deal's league from declared size and earnings.
///
/// Earnings can roll the league up when they imply a larger deal than the
/// asking price does (a 5x earnings heuristic). The industry keyword
/// override then promotes the result by at most one tier.
pub fn classify_league(
    deal_size_minor: u64,
    earnings_minor: Option<u64>,
    industry: Option<&str>,
) -> League {
    let by_size = league_for_size(deal_size_minor);
    let by_earnings = earnings_minor
        .map(|earnings| league_for_size(earnings.saturating_mul(5)))
        .unwrap_or(League::MainStreet);
    let mut league = by_size.max(by_earnings);

    if let Some(industry) = industry {
        let lowered = industry.to_ascii_lowercase();
        if PREMIUM_INDUSTRY_KEYWORDS
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            league = league.promoted();
        }
    }

    league
}

/// Final gate price from a fixed base and the deal's league multiplier.
/// Deterministic, floor-rounded to the minor unit.
pub fn price_for_gate(base_price_minor: u64, league: League) -> u64 {
    base_price_minor.saturating_mul(league.multiplier_bps()) / 10_000
}

/// Build the next hash-chained transaction for a user's ledger.
///
/// The chain is per user: `previous_hash` is the `entry_hash` of the user's
/// latest transaction, `chain_index` its position. The store appends the
/// result in the same atomic unit as the balance mutation.
pub fn build_transaction(
    user_id: &str,
    chain_index: u64,
    amount_minor: i64,
    description: &str,
    deal_id: Option<&str>,
    previous_hash: Option<&str>,
) -> WalletTransaction {
    let created_at = Utc::now();
    let entry_hash = compute_txn_hash(
        user_id,
        chain_index,
        amount_minor,
        description,
        deal_id,
        created_at,
        previous_hash,
    );

    WalletTransaction {
        txn_id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        chain_index,
        amount_minor,
        description: description.to_string(),
        deal_id: deal_id.map(str::to_string),
        created_at,
        previous_hash: previous_hash.map(str::to_string),
        entry_hash,
    }
}

/// Verify one user's transaction chain, ordered by `chain_index`.
pub fn verify_user_chain(entries: &[WalletTransaction]) -> bool {
    let mut previous_hash: Option<String> = None;
    for (expected_index, entry) in entries.iter().enumerate() {
        if entry.chain_index != expected_index as u64 {
            return false;
        }
        let expected_hash = compute_txn_hash(
            &entry.user_id,
            entry.chain_index,
            entry.amount_minor,
            &entry.description,
            entry.deal_id.as_deref(),
            entry.created_at,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash {
            return false;
        }
        if entry.previous_hash != previous_hash {
            return false;
        }
        previous_hash = Some(entry.entry_hash.clone());
    }
    true
}

fn compute_txn_hash(
    user_id: &str,
    chain_index: u64,
    amount_minor: i64,
    description: &str,
    deal_id: Option<&str>,
    created_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "user_id": user_id,
        "chain_index": chain_index,
        "amount_minor": amount_minor,
        "description": description,
        "deal_id": deal_id,
        "created_at": created_at,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_league_price_is_identity() {
        assert_eq!(price_for_gate(1_500, League::MainStreet), 1_500);
    }

    #[test]
    fn pricing_scales_by_league_table() {
        assert_eq!(price_for_gate(1_500, League::Growth), 1_875);
        assert_eq!(price_for_gate(1_500, League::LowerMiddle), 2_250);
        assert_eq!(price_for_gate(1_500, League::MiddleMarket), 3_000);
        assert_eq!(price_for_gate(1_500, League::UpperMiddle), 3_750);
        assert_eq!(price_for_gate(1_500, League::Institutional), 4_500);
    }

    #[test]
    fn league_follows_deal_size_bands() {
        assert_eq!(classify_league(2_000_000, None, None), League::MainStreet);
        assert_eq!(classify_league(10_000_000, None, None), League::Growth);
        assert_eq!(classify_league(50_000_000, None, None), League::LowerMiddle);
        assert_eq!(
            classify_league(600_000_000, None, None),
            League::UpperMiddle
        );
        assert_eq!(
            classify_league(2_000_000_000, None, None),
            League::Institutional
        );
    }

    #[test]
    fn earnings_can_roll_the_league_up() {
        // 2M earnings at 5x implies a 10M deal even when asking is tiny.
        assert_eq!(
            classify_league(100_000, Some(2_000_000), None),
            League::Growth
        );
    }

    #[test]
    fn industry_override_promotes_one_tier() {
        assert_eq!(
            classify_league(2_000_000, None, Some("Vertical SaaS")),
            League::Growth
        );
        // The override never promotes past the top tier.
        assert_eq!(
            classify_league(2_000_000_000, None, Some("software")),
            League::Institutional
        );
        assert_eq!(
            classify_league(2_000_000, None, Some("landscaping")),
            League::MainStreet
        );
    }

    #[test]
    fn transaction_chain_verifies_and_detects_tampering() {
        let first = build_transaction("user-1", 0, 5_000, "top-up", None, None);
        let second = build_transaction(
            "user-1",
            1,
            -1_500,
            "gate settlement",
            Some("deal-1"),
            Some(&first.entry_hash),
        );

        let chain = vec![first, second];
        assert!(verify_user_chain(&chain));

        let mut tampered = chain.clone();
        tampered[1].amount_minor = -1;
        assert!(!verify_user_chain(&tampered));
    }
}
