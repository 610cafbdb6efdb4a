use crate::error::DealflowError;
use crate::store::DealStore;
use crate::types::{Deal, Deliverable};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// External text-generation collaborator. Bounded-latency, may fail; the
/// pipeline wraps every call in its own timeout.
#[async_trait]
pub trait NarrativeClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, DealflowError>;
}

/// Produces the structured content for one deliverable slug.
///
/// Generators are functions of the deal's attributes (plus the narrative
/// collaborator); they never read or depend on deliverable state.
#[async_trait]
pub trait DeliverableGenerator: Send + Sync {
    fn slug(&self) -> &str;

    async fn generate(
        &self,
        deal: &Deal,
        narrative: &dyn NarrativeClient,
    ) -> Result<Value, DealflowError>;
}

/// Slug-keyed generator lookup with an optional fallback for unrecognized
/// deliverable types.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn DeliverableGenerator>>,
    fallback: Option<Arc<dyn DeliverableGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, generator: Arc<dyn DeliverableGenerator>) {
        self.generators
            .insert(generator.slug().to_string(), generator);
    }

    pub fn set_fallback(&mut self, generator: Arc<dyn DeliverableGenerator>) {
        self.fallback = Some(generator);
    }

    pub fn resolve(&self, slug: &str) -> Option<Arc<dyn DeliverableGenerator>> {
        self.generators
            .get(slug)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.generators.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }
}

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Another context already claimed the record, or it is terminal.
    NotClaimed,
    Completed,
    Failed { error: String },
}

const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Claim-and-execute deliverable fulfillment.
///
/// Both triggers (the inline call after a gate advance and the background
/// poller) funnel into [`claim_and_execute`](Self::claim_and_execute); the
/// store's conditional `queued -> generating` update is the only mutual
/// exclusion between them.
#[derive(Clone)]
pub struct FulfillmentPipeline {
    store: DealStore,
    generators: Arc<GeneratorRegistry>,
    narrative: Arc<dyn NarrativeClient>,
    generation_timeout: Duration,
}

impl FulfillmentPipeline {
    pub fn new(
        store: DealStore,
        generators: Arc<GeneratorRegistry>,
        narrative: Arc<dyn NarrativeClient>,
    ) -> Self {
        Self {
            store,
            generators,
            narrative,
            generation_timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn store(&self) -> &DealStore {
        &self.store
    }

    /// Record a deliverable request in `queued` state and return it.
    /// Execution happens later through [`claim_and_execute`](Self::claim_and_execute).
    pub async fn request(
        &self,
        deal_id: &str,
        user_id: &str,
        slug: &str,
    ) -> Result<Deliverable, DealflowError> {
        // Reject requests against deals that do not exist before queueing.
        self.store.deal(deal_id).await?;
        let deliverable = Deliverable::queued(deal_id, user_id, slug);
        self.store.insert_deliverable(&deliverable).await?;
        info!(
            deliverable_id = %deliverable.deliverable_id,
            deal_id,
            slug,
            "deliverable queued"
        );
        Ok(deliverable)
    }

    /// Queue a deliverable and execute it inline on the calling task.
    pub async fn request_inline(
        &self,
        deal_id: &str,
        user_id: &str,
        slug: &str,
    ) -> Result<(Deliverable, ClaimOutcome), DealflowError> {
        let deliverable = self.request(deal_id, user_id, slug).await?;
        let outcome = self.claim_and_execute(&deliverable.deliverable_id).await?;
        Ok((deliverable, outcome))
    }

    /// Claim the deliverable and run its generator to a terminal status.
    ///
    /// The claim is the idempotency guard: a record that is not `queued` is
    /// left untouched and reported as `NotClaimed`. Once claimed, the record
    /// always reaches `complete` or `failed`; generator errors and timeouts
    /// are recorded, never retried internally.
    pub async fn claim_and_execute(
        &self,
        deliverable_id: &str,
    ) -> Result<ClaimOutcome, DealflowError> {
        if !self.store.claim_deliverable(deliverable_id).await? {
            return Ok(ClaimOutcome::NotClaimed);
        }

        let started = Instant::now();
        let result = self.run_generator(deliverable_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(content) => {
                self.store
                    .complete_deliverable(deliverable_id, content, elapsed_ms)
                    .await?;
                info!(deliverable_id, elapsed_ms, "deliverable complete");
                Ok(ClaimOutcome::Completed)
            }
            Err(error) => {
                let detail = error.to_string();
                self.store
                    .fail_deliverable(deliverable_id, &detail, elapsed_ms)
                    .await?;
                warn!(deliverable_id, elapsed_ms, error = %detail, "deliverable failed");
                Ok(ClaimOutcome::Failed { error: detail })
            }
        }
    }

    async fn run_generator(&self, deliverable_id: &str) -> Result<Value, DealflowError> {
        let deliverable = self.store.deliverable(deliverable_id).await?;
        let deal = self.store.deal(&deliverable.deal_id).await?;
        let generator = self.generators.resolve(&deliverable.slug).ok_or_else(|| {
            DealflowError::Generation(format!(
                "no generator registered for slug '{}'",
                deliverable.slug
            ))
        })?;

        match tokio::time::timeout(
            self.generation_timeout,
            generator.generate(&deal, self.narrative.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DealflowError::NarrativeTimeout(
                self.generation_timeout.as_millis() as u64,
            )),
        }
    }
}
