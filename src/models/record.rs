use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub name: String,
}

/// Closed set of raw record types the persistence layer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    RawData,
    GlanceRawData,
    GenericRawData,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::RawData,
        RecordKind::GlanceRawData,
        RecordKind::GenericRawData,
    ];

    pub fn for_exchange(exchange: &str) -> Self {
        match exchange {
            "nova" => RecordKind::RawData,
            "glance" => RecordKind::GlanceRawData,
            _ => RecordKind::GenericRawData,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::RawData => "RawData",
            RecordKind::GlanceRawData => "GlanceRawData",
            RecordKind::GenericRawData => "GenericRawData",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| WorkerError::UnknownRecordType(s.to_string()))
    }
}

/// Persisted form of one notification, as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub deployment_id: i64,
    /// Declared type name; parsed into [`RecordKind`] at dispatch.
    pub type_name: String,
    pub routing_key: String,
    pub exchange: String,
    pub json: String,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn kind(&self) -> Result<RecordKind, WorkerError> {
        self.type_name.parse()
    }
}

/// Fields pulled out of a compute-platform notification payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: Option<String>,
    pub publisher: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
    pub tenant: Option<String>,
    pub instance: Option<String>,
    pub image: Option<String>,
    pub when: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn from_payload(exchange: &str, payload: &JsonValue) -> Self {
        let body = payload.get("payload");
        let publisher = string_at(payload, "publisher_id");
        let (service, host) = match publisher.as_deref().and_then(|p| p.split_once('.')) {
            Some((service, host)) => (Some(service.to_string()), Some(host.to_string())),
            None => (publisher.clone(), None),
        };

        let mut notification = Self {
            event: string_at(payload, "event_type"),
            publisher,
            service,
            host,
            request_id: string_at(payload, "_context_request_id"),
            message_id: string_at(payload, "message_id"),
            tenant: body
                .and_then(|b| string_at(b, "tenant_id"))
                .or_else(|| string_at(payload, "_context_project_id")),
            instance: body.and_then(|b| string_at(b, "instance_id")),
            image: None,
            when: payload
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(parse_timestamp),
        };

        if RecordKind::for_exchange(exchange) == RecordKind::GlanceRawData {
            notification.image = body.and_then(|b| string_at(b, "id"));
            notification.tenant = body
                .and_then(|b| string_at(b, "owner"))
                .or(notification.tenant);
        }

        notification
    }
}

fn string_at(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
