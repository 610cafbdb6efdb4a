use crate::types::JourneyType;
use serde::Serialize;

/// Static definition of one gate inside a journey sequence.
///
/// `required_fields` are the attribute keys that must be present on the deal
/// before the gate may be closed. `base_price_minor` is only meaningful when
/// `paywalled` is set; the final price is league-scaled at advance time.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GateDefinition {
    pub journey: JourneyType,
    pub ordinal: usize,
    pub id: &'static str,
    pub name: &'static str,
    pub paywalled: bool,
    pub base_price_minor: u64,
    pub required_fields: &'static [&'static str],
}

const fn def(
    journey: JourneyType,
    ordinal: usize,
    id: &'static str,
    name: &'static str,
    paywalled: bool,
    base_price_minor: u64,
    required_fields: &'static [&'static str],
) -> GateDefinition {
    GateDefinition {
        journey,
        ordinal,
        id,
        name,
        paywalled,
        base_price_minor,
        required_fields,
    }
}

const SELL_SIDE_GATES: &[GateDefinition] = &[
    def(
        JourneyType::SellSide,
        0,
        "intake",
        "Intake",
        false,
        0,
        &["industry"],
    ),
    def(
        JourneyType::SellSide,
        1,
        "financial_profile",
        "Financial Profile",
        false,
        0,
        &["revenue", "ebitda", "asking_price"],
    ),
    def(
        JourneyType::SellSide,
        2,
        "valuation",
        "Valuation Report",
        true,
        1_500,
        &[],
    ),
    def(
        JourneyType::SellSide,
        3,
        "marketing_package",
        "Marketing Package",
        true,
        2_500,
        &["business_summary"],
    ),
    def(
        JourneyType::SellSide,
        4,
        "buyer_outreach",
        "Buyer Outreach",
        false,
        0,
        &[],
    ),
    def(JourneyType::SellSide, 5, "closing", "Closing", false, 0, &[]),
];

const BUY_SIDE_GATES: &[GateDefinition] = &[
    def(
        JourneyType::BuySide,
        0,
        "intake",
        "Intake",
        false,
        0,
        &["acquisition_budget"],
    ),
    def(
        JourneyType::BuySide,
        1,
        "target_screening",
        "Target Screening",
        true,
        1_000,
        &["industry"],
    ),
    def(
        JourneyType::BuySide,
        2,
        "financing_plan",
        "Financing Plan",
        true,
        1_500,
        &["asking_price"],
    ),
    def(
        JourneyType::BuySide,
        3,
        "diligence",
        "Due Diligence",
        false,
        0,
        &[],
    ),
    def(JourneyType::BuySide, 4, "closing", "Closing", false, 0, &[]),
];

const CAPITAL_RAISE_GATES: &[GateDefinition] = &[
    def(
        JourneyType::CapitalRaise,
        0,
        "intake",
        "Intake",
        false,
        0,
        &["capital_need"],
    ),
    def(
        JourneyType::CapitalRaise,
        1,
        "financial_profile",
        "Financial Profile",
        false,
        0,
        &["revenue", "ebitda"],
    ),
    def(
        JourneyType::CapitalRaise,
        2,
        "capital_stack_model",
        "Capital Stack Model",
        true,
        1_500,
        &[],
    ),
    def(
        JourneyType::CapitalRaise,
        3,
        "lender_outreach",
        "Lender Outreach",
        false,
        0,
        &[],
    ),
    def(
        JourneyType::CapitalRaise,
        4,
        "term_sheet",
        "Term Sheet",
        false,
        0,
        &[],
    ),
];

const POST_ACQUISITION_GATES: &[GateDefinition] = &[
    def(
        JourneyType::PostAcquisition,
        0,
        "onboarding",
        "Onboarding",
        false,
        0,
        &[],
    ),
    def(
        JourneyType::PostAcquisition,
        1,
        "integration_plan",
        "Integration Plan",
        true,
        1_000,
        &["integration_goals"],
    ),
    def(
        JourneyType::PostAcquisition,
        2,
        "operating_review",
        "Operating Review",
        false,
        0,
        &[],
    ),
    def(
        JourneyType::PostAcquisition,
        3,
        "exit_planning",
        "Exit Planning",
        false,
        0,
        &[],
    ),
];

/// Ordered gate sequence for a journey.
pub fn gates_for(journey: JourneyType) -> &'static [GateDefinition] {
    match journey {
        JourneyType::SellSide => SELL_SIDE_GATES,
        JourneyType::BuySide => BUY_SIDE_GATES,
        JourneyType::CapitalRaise => CAPITAL_RAISE_GATES,
        JourneyType::PostAcquisition => POST_ACQUISITION_GATES,
    }
}

pub fn first_gate(journey: JourneyType) -> &'static GateDefinition {
    // Every journey table is non-empty by construction.
    &gates_for(journey)[0]
}

pub fn gate(journey: JourneyType, gate_id: &str) -> Option<&'static GateDefinition> {
    gates_for(journey).iter().find(|g| g.id == gate_id)
}

/// The successor gate, or `None` when `gate_id` is terminal.
///
/// Returns `None` for unknown ids as well; callers that need to distinguish
/// resolve the gate with [`gate`] first.
pub fn next_gate(journey: JourneyType, gate_id: &str) -> Option<&'static GateDefinition> {
    let gates = gates_for(journey);
    let position = gates.iter().position(|g| g.id == gate_id)?;
    gates.get(position + 1)
}

pub fn is_free(journey: JourneyType, gate_id: &str) -> Option<bool> {
    gate(journey, gate_id).map(|g| !g.paywalled)
}
