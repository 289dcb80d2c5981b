use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    broker::Delivery,
    error::{Result, WorkerError},
    handlers::PostProcessTable,
    memory::MemorySampler,
    models::{memory::MemoryReport, message::NotificationEnvelope, record::Deployment},
    store::NotificationStore,
};

/// Handles one delivery at a time: decode, persist, ack, post-process,
/// sample memory. Any error aborts the message and is returned to the
/// supervisor.
pub struct Dispatcher {
    deployment: Deployment,
    exchange: String,
    store: Arc<dyn NotificationStore>,
    post_process: PostProcessTable,
    sampler: MemorySampler,
}

impl Dispatcher {
    pub fn new(
        deployment: Deployment,
        exchange: impl Into<String>,
        store: Arc<dyn NotificationStore>,
        post_process: PostProcessTable,
        sampler: MemorySampler,
    ) -> Self {
        Self {
            deployment,
            exchange: exchange.into(),
            store,
            post_process,
            sampler,
        }
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Messages acked in the current memory sampling window.
    pub fn processed(&self) -> u64 {
        self.sampler.processed()
    }

    pub fn total_processed(&self) -> u64 {
        self.sampler.total_processed()
    }

    pub async fn on_message(&mut self, delivery: Delivery) -> Result<Option<MemoryReport>> {
        let result = self.process(&delivery).await;

        if let Err(e) = &result {
            warn!(
                deployment = %self.deployment.name,
                exchange = %self.exchange,
                routing_key = %delivery.routing_key,
                error = %e,
                error_kind = e.kind(),
                body = %String::from_utf8_lossy(&delivery.body),
                "Problem processing message"
            );
        }

        result
    }

    async fn process(&mut self, delivery: &Delivery) -> Result<Option<MemoryReport>> {
        let envelope = NotificationEnvelope::decode(&delivery.routing_key, &delivery.body)?;
        let serialized = envelope.serialized()?;

        let (raw, notification) = self
            .store
            .process_raw_data(
                &self.deployment,
                (envelope.routing_key.as_str(), &envelope.payload),
                &serialized,
                &self.exchange,
            )
            .await
            .map_err(WorkerError::Persistence)?;

        // Stored is committed: from here a failure loses only the side effect.
        delivery.acker.ack().await?;
        self.sampler.record_processed();
        debug!(raw_id = raw.id, routing_key = %envelope.routing_key, "Message stored and acknowledged");

        self.post_process.dispatch(&raw, &notification).await?;

        Ok(self.sampler.maybe_sample())
    }
}
