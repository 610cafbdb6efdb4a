use dealflow_core::pipeline::{ClaimOutcome, FulfillmentPipeline};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
        }
    }
}

/// Background fulfillment worker: the second trigger path.
///
/// Polls for queued deliverables and pushes each through the same
/// claim-and-execute routine as the inline path. Losing a claim race is the
/// normal case when the inline trigger got there first.
pub struct DeliverableWorker {
    pipeline: FulfillmentPipeline,
    config: WorkerConfig,
}

impl DeliverableWorker {
    pub fn new(pipeline: FulfillmentPipeline, config: WorkerConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "deliverable worker started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(error) = self.drain_once().await {
                warn!(%error, "worker poll errored");
            }
        }
    }

    /// One poll cycle: claim and execute every currently queued deliverable,
    /// up to the batch size.
    pub async fn drain_once(&self) -> Result<usize, dealflow_core::DealflowError> {
        let queued = self
            .pipeline
            .store()
            .queued_deliverables(self.config.batch_size)
            .await?;
        let mut executed = 0;

        for deliverable in queued {
            match self
                .pipeline
                .claim_and_execute(&deliverable.deliverable_id)
                .await
            {
                Ok(ClaimOutcome::NotClaimed) => {
                    debug!(
                        deliverable_id = %deliverable.deliverable_id,
                        "already claimed elsewhere"
                    );
                }
                Ok(_) => executed += 1,
                Err(error) => {
                    warn!(
                        deliverable_id = %deliverable.deliverable_id,
                        %error,
                        "claim attempt errored"
                    );
                }
            }
        }

        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dealflow_core::error::DealflowError;
    use dealflow_core::pipeline::{DeliverableGenerator, GeneratorRegistry, NarrativeClient};
    use dealflow_core::store::DealStore;
    use dealflow_core::types::{Deal, DeliverableStatus, JourneyType};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct StubNarrative;

    #[async_trait]
    impl NarrativeClient for StubNarrative {
        async fn generate(&self, _prompt: &str) -> Result<String, DealflowError> {
            Ok("stub".to_string())
        }
    }

    struct StubGenerator;

    #[async_trait]
    impl DeliverableGenerator for StubGenerator {
        fn slug(&self) -> &str {
            "stub"
        }

        async fn generate(
            &self,
            _deal: &Deal,
            _narrative: &dyn NarrativeClient,
        ) -> Result<Value, DealflowError> {
            Ok(json!({ "stub": true }))
        }
    }

    #[tokio::test]
    async fn drain_executes_queued_work_and_skips_terminal_records() {
        let store = DealStore::memory();
        let deal = Deal::new("user-1", JourneyType::SellSide, "intake", BTreeMap::new());
        store.insert_deal(&deal).await.unwrap();

        let mut registry = GeneratorRegistry::new();
        registry.register(Arc::new(StubGenerator));
        let pipeline =
            FulfillmentPipeline::new(store.clone(), Arc::new(registry), Arc::new(StubNarrative));

        let first = pipeline.request(&deal.deal_id, "user-1", "stub").await.unwrap();
        let second = pipeline.request(&deal.deal_id, "user-1", "stub").await.unwrap();

        let worker = DeliverableWorker::new(pipeline.clone(), WorkerConfig::default());
        assert_eq!(worker.drain_once().await.unwrap(), 2);
        assert_eq!(worker.drain_once().await.unwrap(), 0);

        for id in [&first.deliverable_id, &second.deliverable_id] {
            let record = store.deliverable(id).await.unwrap();
            assert_eq!(record.status, DeliverableStatus::Complete);
        }
    }
}
