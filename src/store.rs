use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::models::record::{Deployment, Notification, RawRecord};

/// Persistence boundary the worker writes through.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Returns the existing deployment, or creates it. The flag is true only
    /// when this call created it.
    async fn get_or_create_deployment(&self, name: &str) -> Result<(Deployment, bool)>;

    /// Stores the raw record and its notification together, or neither.
    async fn process_raw_data(
        &self,
        deployment: &Deployment,
        args: (&str, &JsonValue),
        serialized: &str,
        exchange: &str,
    ) -> Result<(RawRecord, Notification)>;
}
