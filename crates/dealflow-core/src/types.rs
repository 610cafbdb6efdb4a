use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fixed journey catalog. Every deal runs exactly one journey.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JourneyType {
    SellSide,
    BuySide,
    CapitalRaise,
    PostAcquisition,
}

impl JourneyType {
    pub fn name(self) -> &'static str {
        match self {
            Self::SellSide => "sell_side",
            Self::BuySide => "buy_side",
            Self::CapitalRaise => "capital_raise",
            Self::PostAcquisition => "post_acquisition",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Active,
    Closed,
}

/// One active transactional engagement for a user.
///
/// `attributes` is an open bag: journey-specific fields live next to the
/// well-known financial keys (`revenue`, `ebitda`, `sde`, `asking_price`,
/// `industry`). Readiness checks validate the known keys by type at the
/// boundary; everything else is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub deal_id: String,
    pub owner_id: String,
    pub journey: JourneyType,
    pub current_gate: String,
    pub status: DealStatus,
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(
        owner_id: impl Into<String>,
        journey: JourneyType,
        first_gate: impl Into<String>,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            deal_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            journey,
            current_gate: first_gate.into(),
            status: DealStatus::Active,
            attributes,
            created_at: now,
            updated_at: now,
        }
    }

    /// Numeric attribute lookup tolerant of integer and float encodings.
    pub fn numeric_attribute(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }

    pub fn string_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateProgressStatus {
    Pending,
    Active,
    Completed,
}

/// Per-deal record of a single gate's lifecycle. Created lazily as the deal
/// enters the gate; mutated only by the gate engine; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateProgress {
    pub deal_id: String,
    pub gate_id: String,
    pub status: GateProgressStatus,
    pub entered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only wallet ledger entry.
///
/// Entries are hash-chained per user: `previous_hash` anchors the prior
/// transaction of the same user, `entry_hash` covers this entry's material.
/// Credits carry positive `amount_minor`, debits negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub txn_id: String,
    pub user_id: String,
    pub chain_index: u64,
    pub amount_minor: i64,
    pub description: String,
    pub deal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableStatus {
    Queued,
    Generating,
    Complete,
    Failed,
}

impl DeliverableStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One requested generated document.
///
/// The `queued -> generating` transition is the pipeline's sole mutual
/// exclusion point; at most one execution context ever wins it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub deliverable_id: String,
    pub deal_id: String,
    pub user_id: String,
    pub slug: String,
    pub status: DeliverableStatus,
    pub content: Option<Value>,
    pub error_detail: Option<String>,
    pub generation_ms: Option<u64>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deliverable {
    pub fn queued(
        deal_id: impl Into<String>,
        user_id: impl Into<String>,
        slug: impl Into<String>,
    ) -> Self {
        Self {
            deliverable_id: Uuid::new_v4().to_string(),
            deal_id: deal_id.into(),
            user_id: user_id.into(),
            slug: slug.into(),
            status: DeliverableStatus::Queued,
            content: None,
            error_detail: None,
            generation_ms: None,
            requested_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Outcome of a gate advance attempt.
///
/// `PaymentRequired` and `NotReady` are expected, actionable outcomes, not
/// errors: the deal is left exactly where it was and the call is retryable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced {
        new_gate: String,
    },
    NotReady {
        missing: Vec<String>,
    },
    PaymentRequired {
        price_minor: u64,
        balance_minor: u64,
    },
    GateMismatch {
        expected: String,
        actual: String,
    },
}

/// Outcome of an atomic wallet debit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DebitOutcome {
    Applied { new_balance_minor: u64 },
    InsufficientFunds { balance_minor: u64 },
}
