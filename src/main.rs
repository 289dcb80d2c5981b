use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use stacktach_worker::{
    config::{Config, WorkerConfig},
    utils::{init_tracing, select_workers},
    worker::{WorkerOutcome, run_worker, spawn_isolated},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_json);

    let workers = WorkerConfig::from_file(&config.worker_config)?;
    let selected = select_workers(&config, &workers)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested, stopping after the current connection cycle");
                shutdown.store(true, Ordering::SeqCst);
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Second interrupt, exiting now");
                process::exit(130);
            }
        });
    }

    let mut handles = Vec::with_capacity(selected.len());
    for settings in selected {
        let name = format!("{}:{}", settings.name, settings.exchange);
        let database_url = config.database_url.clone();
        let prefetch_count = config.prefetch_count;
        let shutdown = Arc::clone(&shutdown);

        let handle = spawn_isolated(name.clone(), move || {
            run_worker(settings, database_url, prefetch_count, shutdown)
        })?;
        handles.push((name, handle));
    }

    info!(workers = handles.len(), "Workers started");

    let mut failed = 0usize;
    for (name, handle) in handles {
        let outcome = tokio::task::spawn_blocking(move || handle.join())
            .await?
            .unwrap_or_else(|_| WorkerOutcome::Failed(anyhow!("Worker thread panicked")));

        if !outcome.is_success() {
            error!(worker = %name, outcome = ?outcome, "Worker ended abnormally");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} worker(s) ended abnormally", failed));
    }

    Ok(())
}
