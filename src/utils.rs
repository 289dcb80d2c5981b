use anyhow::{Error, Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, WorkerConfig, WorkerSettings};

pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true).with_thread_names(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .init();
    }
}

/// Picks the workers to run: the single pair named by `WORKER_DEPLOYMENT` and
/// `WORKER_EXCHANGE`, or every (deployment, exchange) pair in the file.
pub fn select_workers(config: &Config, workers: &WorkerConfig) -> Result<Vec<WorkerSettings>, Error> {
    match (&config.worker_deployment, &config.worker_exchange) {
        (Some(name), Some(exchange)) => {
            let deployment = workers
                .deployments
                .iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| anyhow!("Deployment '{}' not found in worker config", name))?;

            Ok(vec![deployment.worker_settings(exchange, config)?])
        }
        (None, None) => {
            let mut selected = Vec::new();
            for deployment in &workers.deployments {
                for exchange in deployment.exchanges() {
                    selected.push(deployment.worker_settings(&exchange, config)?);
                }
            }

            if selected.is_empty() {
                return Err(anyhow!("Worker config defines no topics to consume"));
            }

            Ok(selected)
        }
        _ => Err(anyhow!(
            "WORKER_DEPLOYMENT and WORKER_EXCHANGE must be set together"
        )),
    }
}
