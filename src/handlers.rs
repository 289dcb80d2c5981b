use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    error::{Result, WorkerError},
    models::record::{Notification, RawRecord, RecordKind},
};

/// Side effect run once a record is stored and its message acked.
#[async_trait]
pub trait PostProcessHandler: Send + Sync {
    async fn handle(&self, raw: &RawRecord, notification: &Notification) -> anyhow::Result<()>;
}

pub struct InstanceLifecycleHandler;

#[async_trait]
impl PostProcessHandler for InstanceLifecycleHandler {
    async fn handle(&self, raw: &RawRecord, notification: &Notification) -> anyhow::Result<()> {
        let event = notification.event.as_deref().unwrap_or_default();

        if event.starts_with("compute.instance.") {
            info!(
                raw_id = raw.id,
                event,
                instance = notification.instance.as_deref().unwrap_or_default(),
                tenant = notification.tenant.as_deref().unwrap_or_default(),
                request_id = notification.request_id.as_deref().unwrap_or_default(),
                "Instance lifecycle event"
            );
        } else {
            debug!(raw_id = raw.id, event, "Compute notification without lifecycle change");
        }

        Ok(())
    }
}

pub struct ImageLifecycleHandler;

#[async_trait]
impl PostProcessHandler for ImageLifecycleHandler {
    async fn handle(&self, raw: &RawRecord, notification: &Notification) -> anyhow::Result<()> {
        info!(
            raw_id = raw.id,
            event = notification.event.as_deref().unwrap_or_default(),
            image = notification.image.as_deref().unwrap_or_default(),
            owner = notification.tenant.as_deref().unwrap_or_default(),
            "Image lifecycle event"
        );

        Ok(())
    }
}

pub struct GenericEventHandler;

#[async_trait]
impl PostProcessHandler for GenericEventHandler {
    async fn handle(&self, raw: &RawRecord, notification: &Notification) -> anyhow::Result<()> {
        debug!(
            raw_id = raw.id,
            exchange = %raw.exchange,
            event = notification.event.as_deref().unwrap_or_default(),
            "Generic notification stored"
        );

        Ok(())
    }
}

/// Record kind to handler lookup, owned by one worker. Complete by
/// construction: every [`RecordKind`] has a handler.
#[derive(Clone)]
pub struct PostProcessTable {
    handlers: HashMap<RecordKind, Arc<dyn PostProcessHandler>>,
}

impl PostProcessTable {
    pub fn new(handlers: HashMap<RecordKind, Arc<dyn PostProcessHandler>>) -> Result<Self> {
        if let Some(missing) = RecordKind::ALL
            .into_iter()
            .find(|kind| !handlers.contains_key(kind))
        {
            return Err(WorkerError::UnknownRecordType(missing.to_string()));
        }

        Ok(Self { handlers })
    }

    pub fn standard() -> Self {
        let mut handlers: HashMap<RecordKind, Arc<dyn PostProcessHandler>> = HashMap::new();
        handlers.insert(RecordKind::RawData, Arc::new(InstanceLifecycleHandler));
        handlers.insert(RecordKind::GlanceRawData, Arc::new(ImageLifecycleHandler));
        handlers.insert(RecordKind::GenericRawData, Arc::new(GenericEventHandler));

        Self { handlers }
    }

    pub fn with_handler(mut self, kind: RecordKind, handler: Arc<dyn PostProcessHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub async fn dispatch(&self, raw: &RawRecord, notification: &Notification) -> Result<()> {
        let kind = raw.kind()?;
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| WorkerError::UnknownRecordType(kind.to_string()))?;

        handler
            .handle(raw, notification)
            .await
            .map_err(|cause| WorkerError::PostProcess {
                kind: kind.to_string(),
                raw_id: raw.id,
                cause,
            })
    }
}
