use std::{any::Any, convert::Infallible, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::{
    broker::{BrokerConnector, BrokerSession},
    config::WorkerSettings,
    dispatcher::Dispatcher,
    error::{Result, WorkerError},
    handlers::PostProcessTable,
    memory::{MemoryProbe, MemorySampler},
    store::NotificationStore,
    topology::TopologyBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Consuming,
    Backoff,
}

/// Owns the broker connection lifecycle of one worker: connect, declare,
/// consume until something fails, pause, repeat.
pub struct Supervisor<C: BrokerConnector> {
    settings: WorkerSettings,
    connector: C,
    topology: TopologyBuilder,
    dispatcher: Dispatcher,
    state: SupervisorState,
    connect_attempts: u64,
}

impl<C: BrokerConnector> Supervisor<C> {
    /// Resolves the deployment once and builds the long-lived dispatcher.
    pub async fn start(
        settings: WorkerSettings,
        connector: C,
        store: Arc<dyn NotificationStore>,
        post_process: PostProcessTable,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self> {
        if settings.topics.is_empty() {
            return Err(WorkerError::Config(format!(
                "Deployment '{}' has no topics to consume on exchange '{}'",
                settings.name, settings.exchange
            )));
        }

        let (deployment, created) = store
            .get_or_create_deployment(&settings.name)
            .await
            .map_err(WorkerError::Persistence)?;

        info!(
            deployment = %deployment.name,
            deployment_id = deployment.id,
            created,
            "Deployment resolved"
        );

        let sampler = MemorySampler::new(
            settings.name.clone(),
            settings.exchange.clone(),
            settings.memory_sample_interval,
            probe,
        );
        let dispatcher = Dispatcher::new(
            deployment,
            settings.exchange.clone(),
            store,
            post_process,
            sampler,
        );
        let topology = TopologyBuilder::new(settings.durable, settings.queue_arguments.clone());

        Ok(Self {
            settings,
            connector,
            topology,
            dispatcher,
            state: SupervisorState::Disconnected,
            connect_attempts: 0,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs connection cycles while `continue_running` says so. The predicate
    /// is only consulted between cycles. Returns `ExitRequested` when a cycle
    /// fails and the deployment opted into exit-on-exception.
    pub async fn run<F: FnMut() -> bool>(&mut self, mut continue_running: F) -> Result<()> {
        info!(
            deployment = %self.settings.name,
            exchange = %self.settings.exchange,
            host = %self.settings.broker.host,
            port = self.settings.broker.port,
            userid = %self.settings.broker.userid,
            virtual_host = %self.settings.broker.virtual_host,
            "Starting worker"
        );

        while continue_running() {
            debug!(
                deployment = %self.settings.name,
                exchange = %self.settings.exchange,
                "Processing"
            );

            let err = match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(err) => err,
                Err(panic) => WorkerError::Panic(panic_message(panic.as_ref())),
            };

            self.transition(SupervisorState::Backoff);
            error!(
                deployment = %self.settings.name,
                exchange = %self.settings.exchange,
                error = %err,
                error_kind = err.kind(),
                configuration_defect = err.is_configuration_defect(),
                backoff_secs = self.settings.backoff.as_secs(),
                "Worker cycle failed, reconnecting after backoff"
            );

            if self.settings.exit_on_exception {
                return Err(WorkerError::ExitRequested(Box::new(err)));
            }

            sleep(self.settings.backoff).await;
            self.transition(SupervisorState::Disconnected);
        }

        info!(
            deployment = %self.settings.name,
            exchange = %self.settings.exchange,
            "Worker stopped"
        );

        Ok(())
    }

    async fn run_cycle(&mut self) -> WorkerError {
        self.connect_attempts += 1;

        let mut session = match self.connector.connect(&self.settings.broker).await {
            Ok(session) => session,
            Err(e) => return e,
        };
        self.transition(SupervisorState::Consuming);

        let err = match self.consume(&mut session).await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        session.close().await;

        err
    }

    async fn consume(&mut self, session: &mut C::Session) -> Result<Infallible> {
        let queues = self
            .topology
            .declare(session, &self.settings.exchange, &self.settings.topics)
            .await?;
        session.start_consuming(&queues).await?;

        loop {
            let delivery = session.next_delivery().await?;
            self.dispatcher.on_message(delivery).await?;
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(
            deployment = %self.settings.name,
            exchange = %self.settings.exchange,
            from = ?self.state,
            to = ?next,
            "Supervisor state change"
        );
        self.state = next;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
