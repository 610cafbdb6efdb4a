//! Capital stack decision tree.
//!
//! Pure, deterministic routing from a financing request to a tiered layer
//! composition with computed debt service, coverage, and eligibility
//! warnings. Tier selection is a single scan over a sorted threshold table;
//! each tier handler is independently testable. The function never refuses
//! an infeasible deal: it always returns a full structure plus warnings.

use serde::{Deserialize, Serialize};

/// External reference rates, treated as configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceRates {
    pub prime_bps: u32,
    pub sofr_bps: u32,
}

impl Default for ReferenceRates {
    fn default() -> Self {
        Self {
            prime_bps: 850,
            sofr_bps: 530,
        }
    }
}

/// Financing request. `earnings_minor` accepts either interchangeable
/// earnings metric (EBITDA or SDE); the tree does not distinguish them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapitalStackInput {
    pub deal_size_minor: u64,
    pub earnings_minor: Option<u64>,
    pub credit_score: Option<u16>,
    pub us_citizen_or_resident: Option<bool>,
    pub available_equity_minor: Option<u64>,
    #[serde(default)]
    pub includes_real_estate: bool,
    pub seller_note_open: Option<bool>,
    pub industry: Option<String>,
}

impl CapitalStackInput {
    pub fn new(deal_size_minor: u64) -> Self {
        Self {
            deal_size_minor,
            earnings_minor: None,
            credit_score: None,
            us_citizen_or_resident: None,
            available_equity_minor: None,
            includes_real_estate: false,
            seller_note_open: None,
            industry: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapitalTier {
    SbaMicro,
    SbaStandard,
    ConventionalSmall,
    LowerMiddleMarket,
    MiddleMarket,
    UpperMiddleMarket,
    Institutional,
}

impl CapitalTier {
    pub fn name(self) -> &'static str {
        match self {
            Self::SbaMicro => "sba_micro",
            Self::SbaStandard => "sba_standard",
            Self::ConventionalSmall => "conventional_small",
            Self::LowerMiddleMarket => "lower_middle_market",
            Self::MiddleMarket => "middle_market",
            Self::UpperMiddleMarket => "upper_middle_market",
            Self::Institutional => "institutional",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Monthly-amortizing debt; annuity debt service.
    Amortizing,
    /// Interest-only debt; `principal x rate` debt service.
    InterestOnly,
    /// Equity; contributes no debt service.
    Equity,
}

/// One financing layer in the resulting structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancingLayer {
    pub name: String,
    pub kind: LayerKind,
    pub amount_minor: u64,
    pub share_bps: u32,
    pub annual_rate_bps: u32,
    pub term_years: u32,
    pub annual_debt_service_minor: u64,
    pub note: Option<String>,
}

/// Computed capital structure. Transient value object; callers embed it in
/// deliverable content and attach their own `generated_at` timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapitalStackResult {
    pub tier: CapitalTier,
    pub deal_size_minor: u64,
    pub layers: Vec<FinancingLayer>,
    pub annual_debt_service_minor: u64,
    pub coverage_ratio: Option<f64>,
    pub min_coverage_ratio: f64,
    pub meets_coverage: Option<bool>,
    pub eligible: bool,
    pub advisory_required: bool,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Internal layer template before amounts are assigned.
struct LayerSpec {
    name: &'static str,
    kind: LayerKind,
    share_bps: u32,
    annual_rate_bps: u32,
    term_years: u32,
    note: Option<&'static str>,
}

struct TierPlan {
    tier: CapitalTier,
    min_coverage_ratio: f64,
    advisory_required: bool,
    sba_guaranteed: bool,
    layers: Vec<LayerSpec>,
}

const SBA_MIN_CREDIT_SCORE: u16 = 680;
const SBA_GUARANTEE_CAP_MINOR: u64 = 5_000_000;

/// Sorted (exclusive upper bound, tier) routing table. Every deal size maps
/// to exactly one tier; the top tier has no upper bound.
const TIER_TABLE: &[(u64, CapitalTier)] = &[
    (350_000, CapitalTier::SbaMicro),
    (5_000_000, CapitalTier::SbaStandard),
    (10_000_000, CapitalTier::ConventionalSmall),
    (25_000_000, CapitalTier::LowerMiddleMarket),
    (50_000_000, CapitalTier::MiddleMarket),
    (100_000_000, CapitalTier::UpperMiddleMarket),
];

pub fn select_tier(deal_size_minor: u64) -> CapitalTier {
    TIER_TABLE
        .iter()
        .find(|(bound, _)| deal_size_minor < *bound)
        .map(|(_, tier)| *tier)
        .unwrap_or(CapitalTier::Institutional)
}

/// Annual debt service for one layer.
///
/// Amortizing layers use the standard monthly annuity
/// `P x r x (1+r)^n / ((1+r)^n - 1)` annualized by x12, degrading to
/// `P / years` at a zero rate. Interest-only layers pay `P x rate`.
/// Equity contributes nothing.
pub fn annual_debt_service(
    kind: LayerKind,
    principal_minor: u64,
    annual_rate_bps: u32,
    term_years: u32,
) -> u64 {
    match kind {
        LayerKind::Equity => 0,
        LayerKind::InterestOnly => {
            principal_minor.saturating_mul(annual_rate_bps as u64) / 10_000
        }
        LayerKind::Amortizing => {
            if term_years == 0 {
                return 0;
            }
            if annual_rate_bps == 0 {
                return principal_minor / term_years as u64;
            }
            let principal = principal_minor as f64;
            let monthly_rate = annual_rate_bps as f64 / 10_000.0 / 12.0;
            let periods = (term_years * 12) as f64;
            let growth = (1.0 + monthly_rate).powf(periods);
            let payment = principal * monthly_rate * growth / (growth - 1.0);
            (payment * 12.0).round() as u64
        }
    }
}

/// Build the full capital structure for a financing request.
///
/// Deterministic: identical input and rates always produce identical output,
/// including warning text and layer ordering.
pub fn build_capital_stack(
    input: &CapitalStackInput,
    rates: &ReferenceRates,
) -> CapitalStackResult {
    let tier = select_tier(input.deal_size_minor);
    let plan = tier_plan(tier, input, rates);

    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();
    let mut eligible = true;

    let mut specs = plan.layers;

    // A seller unwilling to carry paper folds that share into equity.
    if input.seller_note_open == Some(false) {
        let folded: u32 = specs
            .iter()
            .filter(|spec| spec.name.contains("Seller"))
            .map(|spec| spec.share_bps)
            .sum();
        if folded > 0 {
            specs.retain(|spec| !spec.name.contains("Seller"));
            if let Some(equity) = specs
                .iter_mut()
                .rev()
                .find(|spec| spec.kind == LayerKind::Equity)
            {
                equity.share_bps += folded;
            }
            recommendations.push(
                "Seller financing declined; the seller note share was reallocated to equity."
                    .to_string(),
            );
        }
    }

    let layers = assign_amounts(input.deal_size_minor, &specs);

    let annual_debt_service_minor: u64 = layers
        .iter()
        .map(|layer| layer.annual_debt_service_minor)
        .sum();

    let coverage_ratio = input.earnings_minor.and_then(|earnings| {
        if annual_debt_service_minor == 0 {
            None
        } else {
            Some(earnings as f64 / annual_debt_service_minor as f64)
        }
    });
    let meets_coverage = coverage_ratio.map(|ratio| ratio >= plan.min_coverage_ratio);
    if meets_coverage == Some(false) {
        warnings.push(format!(
            "Coverage ratio {:.2} is below the {:.2} minimum for this tier.",
            coverage_ratio.unwrap_or(0.0),
            plan.min_coverage_ratio
        ));
        recommendations
            .push("Consider a larger equity contribution or a lower purchase price.".to_string());
    }

    if plan.sba_guaranteed {
        let guaranteed: u64 = layers
            .iter()
            .filter(|layer| layer.name.starts_with("SBA"))
            .map(|layer| layer.amount_minor)
            .sum();
        if guaranteed > SBA_GUARANTEE_CAP_MINOR {
            warnings.push(format!(
                "Guaranteed loan layer of {} exceeds the {} program cap.",
                guaranteed, SBA_GUARANTEE_CAP_MINOR
            ));
            eligible = false;
        }

        match input.credit_score {
            Some(score) if score < SBA_MIN_CREDIT_SCORE => {
                warnings.push(format!(
                    "Credit score {} is below the {} program minimum.",
                    score, SBA_MIN_CREDIT_SCORE
                ));
                eligible = false;
            }
            None => {
                warnings.push("Credit score not provided; program eligibility unverified.".to_string());
            }
            _ => {}
        }

        match input.us_citizen_or_resident {
            Some(false) => {
                warnings.push(
                    "Guaranteed loan programs require US citizenship or permanent residency."
                        .to_string(),
                );
                eligible = false;
            }
            None => {
                warnings.push("Citizenship status not provided; program eligibility unverified.".to_string());
            }
            _ => {}
        }
    }

    let required_equity: u64 = layers
        .iter()
        .filter(|layer| layer.kind == LayerKind::Equity)
        .map(|layer| layer.amount_minor)
        .sum();
    if let Some(available) = input.available_equity_minor {
        if available < required_equity {
            warnings.push(format!(
                "Equity gap: {} available against {} required.",
                available, required_equity
            ));
            recommendations.push(
                "Close the equity gap with co-investors or an expanded seller note.".to_string(),
            );
        }
    }

    CapitalStackResult {
        tier,
        deal_size_minor: input.deal_size_minor,
        layers,
        annual_debt_service_minor,
        coverage_ratio,
        min_coverage_ratio: plan.min_coverage_ratio,
        meets_coverage,
        eligible,
        advisory_required: plan.advisory_required,
        warnings,
        recommendations,
    }
}

/// Assign integer amounts from basis-point shares. All layers floor-divide;
/// the final layer absorbs the remainder so amounts sum exactly to deal size.
fn assign_amounts(deal_size_minor: u64, specs: &[LayerSpec]) -> Vec<FinancingLayer> {
    let mut layers = Vec::with_capacity(specs.len());
    let mut assigned: u64 = 0;
    for (position, spec) in specs.iter().enumerate() {
        let amount = if position + 1 == specs.len() {
            deal_size_minor - assigned
        } else {
            deal_size_minor.saturating_mul(spec.share_bps as u64) / 10_000
        };
        assigned += amount;
        layers.push(FinancingLayer {
            name: spec.name.to_string(),
            kind: spec.kind,
            amount_minor: amount,
            share_bps: spec.share_bps,
            annual_rate_bps: spec.annual_rate_bps,
            term_years: spec.term_years,
            annual_debt_service_minor: annual_debt_service(
                spec.kind,
                amount,
                spec.annual_rate_bps,
                spec.term_years,
            ),
            note: spec.note.map(str::to_string),
        });
    }
    layers
}

fn tier_plan(tier: CapitalTier, input: &CapitalStackInput, rates: &ReferenceRates) -> TierPlan {
    let sba_term_years = if input.includes_real_estate { 25 } else { 10 };
    let sba_rate = rates.prime_bps + 275;
    let senior_rate = rates.sofr_bps + 350;
    let second_lien_rate = rates.sofr_bps + 550;
    let mezz_rate = rates.sofr_bps + 700;
    let tlb_rate = rates.sofr_bps + 400;

    match tier {
        CapitalTier::SbaMicro => TierPlan {
            tier,
            min_coverage_ratio: 1.25,
            advisory_required: false,
            sba_guaranteed: true,
            layers: vec![
                LayerSpec {
                    name: "SBA 7(a) Small Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 8_000,
                    annual_rate_bps: sba_rate,
                    term_years: sba_term_years,
                    note: Some("Government-guaranteed small business loan"),
                },
                LayerSpec {
                    name: "Seller Note",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_000,
                    annual_rate_bps: 800,
                    term_years: 5,
                    note: Some("Interest-only with balloon at maturity"),
                },
                LayerSpec {
                    name: "Buyer Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::SbaStandard => TierPlan {
            tier,
            min_coverage_ratio: 1.25,
            advisory_required: false,
            sba_guaranteed: true,
            layers: vec![
                LayerSpec {
                    name: "SBA 7(a) Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 7_500,
                    annual_rate_bps: sba_rate,
                    term_years: sba_term_years,
                    note: Some("Government-guaranteed small business loan"),
                },
                LayerSpec {
                    name: "Seller Note",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_500,
                    annual_rate_bps: 800,
                    term_years: 5,
                    note: Some("Interest-only with balloon at maturity"),
                },
                LayerSpec {
                    name: "Buyer Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::ConventionalSmall => TierPlan {
            tier,
            min_coverage_ratio: 1.35,
            advisory_required: false,
            sba_guaranteed: false,
            layers: vec![
                LayerSpec {
                    name: "Senior Term Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 6_000,
                    annual_rate_bps: senior_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Seller Note",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_500,
                    annual_rate_bps: 800,
                    term_years: 5,
                    note: Some("Interest-only with balloon at maturity"),
                },
                LayerSpec {
                    name: "Mezzanine",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_000,
                    annual_rate_bps: mezz_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Sponsor Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_500,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::LowerMiddleMarket => TierPlan {
            tier,
            min_coverage_ratio: 1.40,
            advisory_required: false,
            sba_guaranteed: false,
            layers: vec![
                LayerSpec {
                    name: "Senior Term Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 5_500,
                    annual_rate_bps: senior_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Mezzanine",
                    kind: LayerKind::InterestOnly,
                    share_bps: 2_000,
                    annual_rate_bps: mezz_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Seller Note",
                    kind: LayerKind::InterestOnly,
                    share_bps: 500,
                    annual_rate_bps: 800,
                    term_years: 5,
                    note: None,
                },
                LayerSpec {
                    name: "Sponsor Equity",
                    kind: LayerKind::Equity,
                    share_bps: 2_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::MiddleMarket => TierPlan {
            tier,
            min_coverage_ratio: 1.50,
            advisory_required: true,
            sba_guaranteed: false,
            layers: vec![
                LayerSpec {
                    name: "Senior Term Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 5_000,
                    annual_rate_bps: senior_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Mezzanine",
                    kind: LayerKind::InterestOnly,
                    share_bps: 2_000,
                    annual_rate_bps: mezz_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Preferred Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: Some("Preferred return accrues outside scheduled debt service"),
                },
                LayerSpec {
                    name: "Common Equity",
                    kind: LayerKind::Equity,
                    share_bps: 2_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::UpperMiddleMarket => TierPlan {
            tier,
            min_coverage_ratio: 1.50,
            advisory_required: true,
            sba_guaranteed: false,
            layers: vec![
                LayerSpec {
                    name: "Senior Term Loan",
                    kind: LayerKind::Amortizing,
                    share_bps: 4_500,
                    annual_rate_bps: senior_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Second Lien",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_500,
                    annual_rate_bps: second_lien_rate,
                    term_years: 7,
                    note: None,
                },
                LayerSpec {
                    name: "Mezzanine",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_500,
                    annual_rate_bps: mezz_rate,
                    term_years: 8,
                    note: None,
                },
                LayerSpec {
                    name: "Preferred Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
                LayerSpec {
                    name: "Sponsor Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_500,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
        CapitalTier::Institutional => TierPlan {
            tier,
            min_coverage_ratio: 1.60,
            advisory_required: true,
            sba_guaranteed: false,
            layers: vec![
                LayerSpec {
                    name: "Term Loan B",
                    kind: LayerKind::InterestOnly,
                    share_bps: 4_000,
                    annual_rate_bps: tlb_rate,
                    term_years: 7,
                    note: Some("Nominal amortization modeled as interest-only"),
                },
                LayerSpec {
                    name: "High Yield Notes",
                    kind: LayerKind::InterestOnly,
                    share_bps: 2_000,
                    annual_rate_bps: 950,
                    term_years: 8,
                    note: None,
                },
                LayerSpec {
                    name: "Mezzanine",
                    kind: LayerKind::InterestOnly,
                    share_bps: 1_000,
                    annual_rate_bps: mezz_rate,
                    term_years: 8,
                    note: None,
                },
                LayerSpec {
                    name: "Preferred Equity",
                    kind: LayerKind::Equity,
                    share_bps: 1_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
                LayerSpec {
                    name: "Sponsor Equity",
                    kind: LayerKind::Equity,
                    share_bps: 2_000,
                    annual_rate_bps: 0,
                    term_years: 0,
                    note: None,
                },
            ],
        },
    }
}
