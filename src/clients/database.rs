use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use tracing::{debug, info};

use crate::{
    models::record::{Deployment, Notification, RawRecord, RecordKind},
    store::NotificationStore,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS raw_data (
    id BIGSERIAL PRIMARY KEY,
    deployment_id BIGINT NOT NULL REFERENCES deployments (id),
    record_type TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    exchange TEXT NOT NULL,
    json TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS notifications (
    raw_id BIGINT PRIMARY KEY REFERENCES raw_data (id),
    event TEXT,
    publisher TEXT,
    service TEXT,
    host TEXT,
    request_id TEXT,
    message_id TEXT,
    tenant TEXT,
    instance TEXT,
    image TEXT,
    occurred_at TIMESTAMPTZ,
    payload JSONB NOT NULL
);
"#;

/// PostgreSQL store. Connections are pooled and checked before use, so a
/// database restart costs the in-flight message only.
pub struct DatabaseClient {
    pool: PgPool,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .test_before_acquire(true)
            .connect(database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to create schema: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl NotificationStore for DatabaseClient {
    async fn get_or_create_deployment(&self, name: &str) -> Result<(Deployment, bool)> {
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO deployments (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to create deployment {}: {}", name, e))?;

        if let Some(id) = inserted {
            let deployment = Deployment {
                id,
                name: name.to_string(),
            };
            return Ok((deployment, true));
        }

        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM deployments WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to load deployment {}: {}", name, e))?;

        Ok((
            Deployment {
                id,
                name: name.to_string(),
            },
            false,
        ))
    }

    async fn process_raw_data(
        &self,
        deployment: &Deployment,
        args: (&str, &JsonValue),
        serialized: &str,
        exchange: &str,
    ) -> Result<(RawRecord, Notification)> {
        let (routing_key, payload) = args;
        let kind = RecordKind::for_exchange(exchange);
        let notification = Notification::from_payload(exchange, payload);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO raw_data (deployment_id, record_type, routing_key, exchange, json)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, created_at
            "#,
        )
        .bind(deployment.id)
        .bind(kind.as_str())
        .bind(routing_key)
        .bind(exchange)
        .bind(serialized)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| anyhow!("Failed to insert raw data: {}", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| anyhow!("Raw data insert returned no id: {}", e))?;
        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| anyhow!("Raw data insert returned no timestamp: {}", e))?;

        let raw = RawRecord {
            id,
            deployment_id: deployment.id,
            type_name: kind.to_string(),
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
            json: serialized.to_string(),
            created_at,
        };

        sqlx::query(
            r#"
            INSERT INTO notifications (
                raw_id, event, publisher, service, host, request_id,
                message_id, tenant, instance, image, occurred_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(raw.id)
        .bind(&notification.event)
        .bind(&notification.publisher)
        .bind(&notification.service)
        .bind(&notification.host)
        .bind(&notification.request_id)
        .bind(&notification.message_id)
        .bind(&notification.tenant)
        .bind(&notification.instance)
        .bind(&notification.image)
        .bind(notification.when)
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!("Failed to insert notification for raw {}: {}", raw.id, e))?;

        tx.commit()
            .await
            .map_err(|e| anyhow!("Failed to commit raw data {}: {}", raw.id, e))?;

        debug!(raw_id = raw.id, record_type = %kind, "Raw data stored");

        Ok((raw, notification))
    }
}
