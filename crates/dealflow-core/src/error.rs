use thiserror::Error;

/// Dealflow core errors.
#[derive(Debug, Error)]
pub enum DealflowError {
    #[error("Unknown deal '{0}'")]
    UnknownDeal(String),

    #[error("Unknown deliverable '{0}'")]
    UnknownDeliverable(String),

    #[error("Unknown gate '{gate}' for journey '{journey}'")]
    UnknownGate { journey: String, gate: String },

    #[error("Invalid gate transition from '{from}' to '{to}': {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Wallet ledger error: {0}")]
    Ledger(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deliverable generation failed: {0}")]
    Generation(String),

    #[error("Narrative collaborator timed out after {0}ms")]
    NarrativeTimeout(u64),
}

impl DealflowError {
    pub fn unknown_gate(journey: impl Into<String>, gate: impl Into<String>) -> Self {
        Self::UnknownGate {
            journey: journey.into(),
            gate: gate.into(),
        }
    }
}
