//! Dealflow core: journey gate progression, wallet settlement, deliverable
//! fulfillment, and deterministic capital stack modeling.
//!
//! The crate is storage-backed but transport-agnostic: the service crate puts
//! a REST surface in front of it, and the generators crate supplies the
//! concrete deliverable generators. The invariants that matter live here:
//! a gate debit settles at most once, a deliverable executes at most once,
//! and the capital stack function is pure and reproducible.

#![deny(unsafe_code)]

pub mod capital;
pub mod error;
pub mod gates;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod types;
pub mod wallet;

pub use capital::{
    build_capital_stack, CapitalStackInput, CapitalStackResult, CapitalTier, FinancingLayer,
    LayerKind, ReferenceRates,
};
pub use error::DealflowError;
pub use gates::GateEngine;
pub use pipeline::{
    ClaimOutcome, DeliverableGenerator, FulfillmentPipeline, GeneratorRegistry, NarrativeClient,
};
pub use registry::{first_gate, gate, gates_for, is_free, next_gate, GateDefinition};
pub use store::{ChargeSpec, CommitAdvance, DealStore, StoreConfig};
pub use types::{
    AdvanceOutcome, Deal, DealStatus, DebitOutcome, Deliverable, DeliverableStatus, GateProgress,
    GateProgressStatus, JourneyType, WalletTransaction,
};
pub use wallet::{classify_league, price_for_gate, League};
