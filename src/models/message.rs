use serde_json::Value as JsonValue;

use crate::error::Result;

/// One decoded delivery. Lives for a single dispatch cycle only.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEnvelope {
    pub routing_key: String,
    pub payload: JsonValue,
}

impl NotificationEnvelope {
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self> {
        let payload = serde_json::from_slice::<JsonValue>(body)?;

        Ok(Self {
            routing_key: routing_key.to_string(),
            payload,
        })
    }

    /// The `[routing_key, payload]` pair as stored alongside the raw record.
    pub fn serialized(&self) -> Result<String> {
        Ok(serde_json::to_string(&(&self.routing_key, &self.payload))?)
    }
}
