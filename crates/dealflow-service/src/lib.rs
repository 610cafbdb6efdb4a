#![deny(unsafe_code)]

pub mod worker;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dealflow_core::capital::{build_capital_stack, CapitalStackInput, CapitalStackResult, ReferenceRates};
use dealflow_core::pipeline::{ClaimOutcome, FulfillmentPipeline, GeneratorRegistry, NarrativeClient};
use dealflow_core::store::{DealStore, StoreConfig};
use dealflow_core::types::{
    AdvanceOutcome, Deal, Deliverable, GateProgress, JourneyType, WalletTransaction,
};
use dealflow_core::wallet::verify_user_chain;
use dealflow_core::{DealflowError, GateEngine};
use dealflow_generators::{
    CapitalStackGenerator, NarrativeDocumentGenerator, StaticNarrativeClient, ValuationGenerator,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub reference_rates: ReferenceRates,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            reference_rates: ReferenceRates::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: GateEngine,
    pub pipeline: FulfillmentPipeline,
    pub store: DealStore,
    pub reference_rates: ReferenceRates,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, DealflowError> {
        Self::bootstrap_with_narrative(config, Arc::new(StaticNarrativeClient)).await
    }

    /// Bootstrap with a caller-supplied narrative collaborator.
    pub async fn bootstrap_with_narrative(
        config: ServiceConfig,
        narrative: Arc<dyn NarrativeClient>,
    ) -> Result<Self, DealflowError> {
        let store = DealStore::bootstrap(config.store).await?;

        let mut generators = GeneratorRegistry::new();
        generators.register(Arc::new(CapitalStackGenerator::new(config.reference_rates)));
        generators.register(Arc::new(ValuationGenerator));
        generators.set_fallback(Arc::new(NarrativeDocumentGenerator));

        let pipeline = FulfillmentPipeline::new(store.clone(), Arc::new(generators), narrative);
        let engine = GateEngine::new(store.clone());

        Ok(Self {
            engine,
            pipeline,
            store,
            reference_rates: config.reference_rates,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/deals", post(create_deal))
        .route("/v1/deals/:deal_id", get(get_deal))
        .route("/v1/deals/:deal_id/attributes", post(update_attributes))
        .route("/v1/deals/:deal_id/advance", post(advance_gate))
        .route("/v1/deals/:deal_id/close", post(close_deal))
        .route("/v1/deals/:deal_id/progress", get(get_progress))
        .route("/v1/deliverables", post(request_deliverable))
        .route("/v1/deliverables/:deliverable_id", get(get_deliverable))
        .route("/v1/deliverables/:deliverable_id/retry", post(retry_deliverable))
        .route("/v1/wallets/:user_id", get(get_balance))
        .route("/v1/wallets/:user_id/topup", post(top_up))
        .route("/v1/wallets/:user_id/transactions", get(list_transactions))
        .route("/v1/capital-stack", post(compute_capital_stack))
        .with_state(state)
}

/// Deliverable produced on entry into a gate, when one applies.
fn deliverable_slug_for_gate(gate_id: &str) -> Option<&'static str> {
    match gate_id {
        "valuation" => Some("valuation"),
        "capital_stack_model" | "financing_plan" => Some("capital_stack"),
        "marketing_package" | "target_screening" | "integration_plan" => {
            Some("narrative_document")
        }
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] DealflowError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => {
                let status = match &err {
                    DealflowError::UnknownDeal(_)
                    | DealflowError::UnknownDeliverable(_)
                    | DealflowError::UnknownGate { .. } => StatusCode::NOT_FOUND,
                    DealflowError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "dealflow-service",
        store_backend: state.store.backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CreateDealRequest {
    owner_id: String,
    journey: JourneyType,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

async fn create_deal(
    State(state): State<ServiceState>,
    Json(request): Json<CreateDealRequest>,
) -> Result<(StatusCode, Json<Deal>), ApiError> {
    if request.owner_id.trim().is_empty() {
        return Err(ApiError::bad_request("owner_id must not be empty"));
    }
    let deal = state
        .engine
        .start_journey(&request.owner_id, request.journey, request.attributes)
        .await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn get_deal(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> Result<Json<Deal>, ApiError> {
    Ok(Json(state.engine.deal(&deal_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateAttributesRequest {
    attributes: BTreeMap<String, Value>,
}

async fn update_attributes(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Json(request): Json<UpdateAttributesRequest>,
) -> Result<Json<Deal>, ApiError> {
    Ok(Json(
        state
            .engine
            .update_attributes(&deal_id, request.attributes)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct AdvanceRequest {
    from_gate: String,
    to_gate: String,
}

#[derive(Debug, Clone, Serialize)]
struct AdvanceResponse {
    #[serde(flatten)]
    outcome: AdvanceOutcome,
    /// Deliverable queued for the newly entered gate, when one applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    deliverable_id: Option<String>,
}

async fn advance_gate(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<AdvanceResponse>, ApiError> {
    let outcome = state
        .engine
        .advance(&deal_id, &request.from_gate, &request.to_gate)
        .await?;

    let mut deliverable_id = None;
    if let AdvanceOutcome::Advanced { new_gate } = &outcome {
        if let Some(slug) = deliverable_slug_for_gate(new_gate) {
            let deal = state.engine.deal(&deal_id).await?;
            let deliverable = state
                .pipeline
                .request(&deal_id, &deal.owner_id, slug)
                .await?;
            deliverable_id = Some(deliverable.deliverable_id.clone());

            // Inline trigger; the background worker is the second path and
            // the claim guard arbitrates between them.
            let pipeline = state.pipeline.clone();
            tokio::spawn(async move {
                if let Err(error) = pipeline
                    .claim_and_execute(&deliverable.deliverable_id)
                    .await
                {
                    warn!(
                        deliverable_id = %deliverable.deliverable_id,
                        %error,
                        "inline deliverable execution errored"
                    );
                }
            });
        }
    }

    Ok(Json(AdvanceResponse {
        outcome,
        deliverable_id,
    }))
}

/// Mark a deal closed. Closed deals are kept for audit and refuse further
/// gate advances.
async fn close_deal(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> Result<Json<Deal>, ApiError> {
    state.store.close_deal(&deal_id).await?;
    Ok(Json(state.engine.deal(&deal_id).await?))
}

async fn get_progress(
    State(state): State<ServiceState>,
    Path(deal_id): Path<String>,
) -> Result<Json<Vec<GateProgress>>, ApiError> {
    // Resolve the deal first so unknown ids are 404s, not empty lists.
    state.engine.deal(&deal_id).await?;
    Ok(Json(state.engine.progress(&deal_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct DeliverableRequest {
    deal_id: String,
    user_id: String,
    slug: String,
    /// Execute on this request's task instead of waiting for the worker.
    #[serde(default)]
    inline: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DeliverableResponse {
    deliverable: Deliverable,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn describe_outcome(outcome: &ClaimOutcome) -> (&'static str, Option<String>) {
    match outcome {
        ClaimOutcome::NotClaimed => ("not_claimed", None),
        ClaimOutcome::Completed => ("completed", None),
        ClaimOutcome::Failed { error } => ("failed", Some(error.clone())),
    }
}

async fn request_deliverable(
    State(state): State<ServiceState>,
    Json(request): Json<DeliverableRequest>,
) -> Result<(StatusCode, Json<DeliverableResponse>), ApiError> {
    if request.inline {
        let (deliverable, outcome) = state
            .pipeline
            .request_inline(&request.deal_id, &request.user_id, &request.slug)
            .await?;
        let refreshed = state
            .store
            .deliverable(&deliverable.deliverable_id)
            .await?;
        let (outcome, error) = describe_outcome(&outcome);
        return Ok((
            StatusCode::CREATED,
            Json(DeliverableResponse {
                deliverable: refreshed,
                outcome: Some(outcome.to_string()),
                error,
            }),
        ));
    }

    let deliverable = state
        .pipeline
        .request(&request.deal_id, &request.user_id, &request.slug)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DeliverableResponse {
            deliverable,
            outcome: None,
            error: None,
        }),
    ))
}

async fn get_deliverable(
    State(state): State<ServiceState>,
    Path(deliverable_id): Path<String>,
) -> Result<Json<Deliverable>, ApiError> {
    Ok(Json(state.store.deliverable(&deliverable_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct RetryResponse {
    deliverable: Deliverable,
    outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Reset a failed deliverable to `queued` and reclaim it immediately.
async fn retry_deliverable(
    State(state): State<ServiceState>,
    Path(deliverable_id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    if !state.store.requeue_failed(&deliverable_id).await? {
        return Err(ApiError::Http {
            status: StatusCode::CONFLICT,
            message: format!("deliverable '{deliverable_id}' is not in a failed state"),
        });
    }
    let outcome = state.pipeline.claim_and_execute(&deliverable_id).await?;
    let deliverable = state.store.deliverable(&deliverable_id).await?;
    let (outcome, error) = describe_outcome(&outcome);
    Ok(Json(RetryResponse {
        deliverable,
        outcome: outcome.to_string(),
        error,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    user_id: String,
    balance_minor: u64,
}

async fn get_balance(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance_minor = state.store.balance(&user_id).await?;
    Ok(Json(BalanceResponse {
        user_id,
        balance_minor,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct TopUpRequest {
    amount_minor: u64,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TopUpResponse {
    user_id: String,
    new_balance_minor: u64,
}

/// Credit a wallet. Invoked after an external payment confirmation; the
/// payment rail itself is a collaborator.
async fn top_up(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<TopUpResponse>, ApiError> {
    if request.amount_minor == 0 {
        return Err(ApiError::bad_request("amount_minor must be positive"));
    }
    let description = request.description.as_deref().unwrap_or("wallet top-up");
    let new_balance_minor = state
        .store
        .credit(&user_id, request.amount_minor, description)
        .await?;
    Ok(Json(TopUpResponse {
        user_id,
        new_balance_minor,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct TransactionsResponse {
    user_id: String,
    total: usize,
    chain_valid: bool,
    items: Vec<WalletTransaction>,
}

async fn list_transactions(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let items = state.store.transactions(&user_id).await?;
    let chain_valid = verify_user_chain(&items);
    Ok(Json(TransactionsResponse {
        user_id,
        total: items.len(),
        chain_valid,
        items,
    }))
}

/// Direct what-if capital stack modeling, no deal or deliverable required.
async fn compute_capital_stack(
    State(state): State<ServiceState>,
    Json(input): Json<CapitalStackInput>,
) -> Result<Json<CapitalStackResult>, ApiError> {
    if input.deal_size_minor == 0 {
        return Err(ApiError::bad_request("deal_size_minor must be positive"));
    }
    Ok(Json(build_capital_stack(&input, &state.reference_rates)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_the_store_backend() {
        let router = test_router().await;
        let (status, body) = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store_backend"], "memory");
    }

    #[tokio::test]
    async fn deal_lifecycle_flows_through_the_paywall() {
        let router = test_router().await;

        let (status, _) = send(
            &router,
            "POST",
            "/v1/wallets/user-1/topup",
            Some(json!({ "amount_minor": 5_000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, deal) = send(
            &router,
            "POST",
            "/v1/deals",
            Some(json!({
                "owner_id": "user-1",
                "journey": "sell_side",
                "attributes": {
                    "industry": "landscaping",
                    "revenue": 3_000_000,
                    "ebitda": 400_000,
                    "asking_price": 2_000_000
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let deal_id = deal["deal_id"].as_str().unwrap().to_string();
        assert_eq!(deal["current_gate"], "intake");

        let (status, body) = send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "intake", "to_gate": "financial_profile" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "advanced");

        let (status, body) = send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "financial_profile", "to_gate": "valuation" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "advanced");
        assert!(body["deliverable_id"].is_string());

        let (status, body) = send(&router, "GET", "/v1/wallets/user-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance_minor"], 3_500);

        let (status, body) =
            send(&router, "GET", "/v1/wallets/user-1/transactions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["chain_valid"], true);
    }

    #[tokio::test]
    async fn shortfall_surfaces_as_payment_required() {
        let router = test_router().await;
        send(
            &router,
            "POST",
            "/v1/wallets/user-2/topup",
            Some(json!({ "amount_minor": 1_000 })),
        )
        .await;

        let (_, deal) = send(
            &router,
            "POST",
            "/v1/deals",
            Some(json!({
                "owner_id": "user-2",
                "journey": "sell_side",
                "attributes": {
                    "industry": "retail",
                    "revenue": 1_200_000,
                    "ebitda": 200_000,
                    "asking_price": 900_000
                }
            })),
        )
        .await;
        let deal_id = deal["deal_id"].as_str().unwrap().to_string();

        send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "intake", "to_gate": "financial_profile" })),
        )
        .await;
        let (status, body) = send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "financial_profile", "to_gate": "valuation" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "payment_required");
        assert_eq!(body["price_minor"], 1_500);
        assert_eq!(body["balance_minor"], 1_000);

        let (_, deal) = send(&router, "GET", &format!("/v1/deals/{deal_id}"), None).await;
        assert_eq!(deal["current_gate"], "financial_profile");
    }

    #[tokio::test]
    async fn inline_deliverable_request_completes() {
        let router = test_router().await;
        let (_, deal) = send(
            &router,
            "POST",
            "/v1/deals",
            Some(json!({
                "owner_id": "user-3",
                "journey": "capital_raise",
                "attributes": {
                    "capital_need": 2_000_000,
                    "ebitda": 400_000
                }
            })),
        )
        .await;
        let deal_id = deal["deal_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &router,
            "POST",
            "/v1/deliverables",
            Some(json!({
                "deal_id": deal_id,
                "user_id": "user-3",
                "slug": "capital_stack",
                "inline": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["deliverable"]["status"], "complete");
        assert_eq!(body["deliverable"]["content"]["stack"]["tier"], "sba_standard");
    }

    #[tokio::test]
    async fn skipped_gate_is_a_conflict() {
        let router = test_router().await;
        let (_, deal) = send(
            &router,
            "POST",
            "/v1/deals",
            Some(json!({
                "owner_id": "user-4",
                "journey": "sell_side",
                "attributes": { "industry": "retail" }
            })),
        )
        .await;
        let deal_id = deal["deal_id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "intake", "to_gate": "valuation" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn closed_deals_refuse_further_advances() {
        let router = test_router().await;
        let (_, deal) = send(
            &router,
            "POST",
            "/v1/deals",
            Some(json!({
                "owner_id": "user-5",
                "journey": "post_acquisition",
                "attributes": {}
            })),
        )
        .await;
        let deal_id = deal["deal_id"].as_str().unwrap().to_string();

        let (status, closed) =
            send(&router, "POST", &format!("/v1/deals/{deal_id}/close"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(closed["status"], "closed");

        let (status, _) = send(
            &router,
            "POST",
            &format!("/v1/deals/{deal_id}/advance"),
            Some(json!({ "from_gate": "onboarding", "to_gate": "integration_plan" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_deal_is_not_found() {
        let router = test_router().await;
        let (status, _) = send(&router, "GET", "/v1/deals/no-such-deal", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn capital_stack_endpoint_models_directly() {
        let router = test_router().await;
        let (status, body) = send(
            &router,
            "POST",
            "/v1/capital-stack",
            Some(json!({
                "deal_size_minor": 2_000_000,
                "earnings_minor": 400_000,
                "credit_score": 720,
                "us_citizen_or_resident": true,
                "available_equity_minor": 250_000,
                "includes_real_estate": false,
                "seller_note_open": null,
                "industry": "landscaping"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tier"], "sba_standard");
        assert_eq!(body["eligible"], true);
        let total: u64 = body["layers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|layer| layer["amount_minor"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 2_000_000);
    }
}
