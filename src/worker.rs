use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use anyhow::{Error, anyhow};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    clients::{database::DatabaseClient, rbmq::RabbitMqConnector},
    config::WorkerSettings,
    error::{Result, WorkerError},
    handlers::PostProcessTable,
    memory::SysinfoProbe,
    supervisor::Supervisor,
};

/// How a worker thread ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// The run predicate turned false.
    Stopped,
    /// The deployment opted into exit-on-exception and a cycle failed.
    Exited(WorkerError),
    /// The worker never got to consume.
    Failed(Error),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Stopped)
    }
}

/// Runs one (deployment, exchange) worker until `shutdown` is raised or the
/// exit-on-exception policy fires.
pub async fn run_worker(
    settings: WorkerSettings,
    database_url: String,
    prefetch_count: u16,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let database = DatabaseClient::connect(&database_url)
        .await
        .map_err(WorkerError::Persistence)?;
    database
        .ensure_schema()
        .await
        .map_err(WorkerError::Persistence)?;

    let consumer_tag = format!(
        "{}.{}.{}",
        settings.name,
        settings.exchange,
        Uuid::new_v4().simple()
    );
    let connector = RabbitMqConnector::new(consumer_tag, prefetch_count);

    let mut supervisor = Supervisor::start(
        settings,
        connector,
        Arc::new(database),
        PostProcessTable::standard(),
        Box::new(SysinfoProbe::new()),
    )
    .await?;

    supervisor
        .run(|| !shutdown.load(Ordering::SeqCst))
        .await
}

/// Runs `worker` on its own thread with a current-thread runtime. Whatever
/// happens to it ends this thread only; other workers keep consuming.
pub fn spawn_isolated<F, Fut>(name: String, worker: F) -> anyhow::Result<JoinHandle<WorkerOutcome>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>>,
{
    let thread_name = name.clone();

    thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(worker = %name, error = %e, "Failed to build worker runtime");
                    return WorkerOutcome::Failed(anyhow!("Failed to build worker runtime: {}", e));
                }
            };

            match runtime.block_on(worker()) {
                Ok(()) => {
                    info!(worker = %name, "Worker finished");
                    WorkerOutcome::Stopped
                }
                Err(WorkerError::ExitRequested(cause)) => {
                    error!(
                        worker = %name,
                        error = %cause,
                        error_kind = cause.kind(),
                        "Worker exiting on exception"
                    );
                    WorkerOutcome::Exited(*cause)
                }
                Err(e) => {
                    error!(
                        worker = %name,
                        error = %e,
                        error_kind = e.kind(),
                        "Worker failed to start"
                    );
                    WorkerOutcome::Failed(e.into())
                }
            }
        })
        .map_err(|e| anyhow!("Failed to spawn worker thread: {}", e))
}
