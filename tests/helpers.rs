use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use stacktach_worker::{
    broker::{Acknowledge, BrokerConnector, BrokerSession, Delivery},
    config::{BrokerConfig, Transport, WorkerSettings},
    error::WorkerError,
    handlers::{PostProcessHandler, PostProcessTable},
    memory::{MemoryProbe, MemorySampler},
    models::{
        record::{Deployment, Notification, RawRecord, RecordKind},
        topology::{Exchange, Queue, TopicSubscription},
    },
    store::NotificationStore,
};

/// Ordered record of what happened to a message, shared by all fakes.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }
}

pub struct LoggingAcker {
    log: EventLog,
}

#[async_trait]
impl Acknowledge for LoggingAcker {
    async fn ack(&self) -> stacktach_worker::error::Result<()> {
        self.log.push("ack");
        Ok(())
    }
}

pub fn delivery(routing_key: &str, body: &str, log: &EventLog) -> Delivery {
    Delivery {
        routing_key: routing_key.to_string(),
        body: body.as_bytes().to_vec(),
        acker: Box::new(LoggingAcker { log: log.clone() }),
    }
}

#[derive(Default)]
struct Tables {
    deployments: HashMap<String, Deployment>,
    raw_records: Vec<(RawRecord, Notification)>,
}

/// Process-local store. Ids are assigned in insertion order starting at 1.
#[derive(Default)]
pub struct InMemoryStore {
    tables: tokio::sync::Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raw_records(&self) -> Vec<(RawRecord, Notification)> {
        self.tables.lock().await.raw_records.clone()
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn get_or_create_deployment(&self, name: &str) -> Result<(Deployment, bool)> {
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.deployments.get(name) {
            return Ok((existing.clone(), false));
        }

        let deployment = Deployment {
            id: tables.deployments.len() as i64 + 1,
            name: name.to_string(),
        };
        tables
            .deployments
            .insert(name.to_string(), deployment.clone());

        Ok((deployment, true))
    }

    async fn process_raw_data(
        &self,
        deployment: &Deployment,
        args: (&str, &JsonValue),
        serialized: &str,
        exchange: &str,
    ) -> Result<(RawRecord, Notification)> {
        let (routing_key, payload) = args;
        let mut tables = self.tables.lock().await;

        let raw = RawRecord {
            id: tables.raw_records.len() as i64 + 1,
            deployment_id: deployment.id,
            type_name: RecordKind::for_exchange(exchange).to_string(),
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
            json: serialized.to_string(),
            created_at: Utc::now(),
        };
        let notification = Notification::from_payload(exchange, payload);

        tables.raw_records.push((raw.clone(), notification.clone()));

        Ok((raw, notification))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistCall {
    pub deployment: Deployment,
    pub routing_key: String,
    pub payload: JsonValue,
    pub serialized: String,
    pub exchange: String,
}

/// In-memory store with failure injection and call recording.
pub struct ScriptedStore {
    inner: InMemoryStore,
    log: EventLog,
    pub fail_persistence: bool,
    pub type_name_override: Option<String>,
    pub calls: Mutex<Vec<PersistCall>>,
}

impl ScriptedStore {
    pub fn new(log: &EventLog) -> Self {
        Self {
            inner: InMemoryStore::new(),
            log: log.clone(),
            fail_persistence: false,
            type_name_override: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(log: &EventLog) -> Self {
        Self {
            fail_persistence: true,
            ..Self::new(log)
        }
    }

    pub fn calls(&self) -> Vec<PersistCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationStore for ScriptedStore {
    async fn get_or_create_deployment(&self, name: &str) -> Result<(Deployment, bool)> {
        self.inner.get_or_create_deployment(name).await
    }

    async fn process_raw_data(
        &self,
        deployment: &Deployment,
        args: (&str, &JsonValue),
        serialized: &str,
        exchange: &str,
    ) -> Result<(RawRecord, Notification)> {
        self.calls.lock().unwrap().push(PersistCall {
            deployment: deployment.clone(),
            routing_key: args.0.to_string(),
            payload: args.1.clone(),
            serialized: serialized.to_string(),
            exchange: exchange.to_string(),
        });

        if self.fail_persistence {
            self.log.push("persist_failed");
            return Err(anyhow!("database unavailable"));
        }

        let (mut raw, notification) = self
            .inner
            .process_raw_data(deployment, args, serialized, exchange)
            .await?;
        if let Some(type_name) = &self.type_name_override {
            raw.type_name = type_name.clone();
        }
        self.log.push("persist");

        Ok((raw, notification))
    }
}

pub enum HandlerBehaviour {
    Succeed,
    Fail,
    Panic,
}

pub struct RecordingHandler {
    log: EventLog,
    behaviour: HandlerBehaviour,
    pub seen: Mutex<Vec<(RawRecord, Notification)>>,
}

impl RecordingHandler {
    pub fn new(log: &EventLog, behaviour: HandlerBehaviour) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            behaviour,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<(RawRecord, Notification)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PostProcessHandler for RecordingHandler {
    async fn handle(&self, raw: &RawRecord, notification: &Notification) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((raw.clone(), notification.clone()));
        self.log.push(format!("post_process:{}", raw.type_name));

        match self.behaviour {
            HandlerBehaviour::Succeed => Ok(()),
            HandlerBehaviour::Fail => Err(anyhow!("usage table locked")),
            HandlerBehaviour::Panic => panic!("handler blew up"),
        }
    }
}

pub fn table_with(kind: RecordKind, handler: Arc<RecordingHandler>) -> PostProcessTable {
    PostProcessTable::standard().with_handler(kind, handler)
}

/// Returns scripted sizes in order, repeating the last one.
pub struct FakeProbe {
    sizes: Vec<u64>,
    reads: Arc<AtomicUsize>,
}

impl FakeProbe {
    pub fn new(sizes: Vec<u64>) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sizes,
                reads: Arc::clone(&reads),
            },
            reads,
        )
    }
}

impl MemoryProbe for FakeProbe {
    fn virtual_size(&mut self) -> u64 {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        let idx = read.min(self.sizes.len().saturating_sub(1));
        self.sizes.get(idx).copied().unwrap_or(0)
    }
}

pub fn sampler(sizes: Vec<u64>) -> (MemorySampler, Arc<AtomicUsize>) {
    let (probe, reads) = FakeProbe::new(sizes);
    (
        MemorySampler::new("east.prod", "nova", Duration::from_secs(30), Box::new(probe)),
        reads,
    )
}

#[derive(Default)]
pub struct SessionRecord {
    pub exchanges: Vec<Exchange>,
    pub queues: Vec<Queue>,
    pub consumed: Vec<String>,
    pub closed: bool,
}

pub struct MockSession {
    record: Arc<Mutex<SessionRecord>>,
    deliveries: VecDeque<Delivery>,
    reject_queues: bool,
}

impl MockSession {
    pub fn new(deliveries: Vec<Delivery>) -> (Self, Arc<Mutex<SessionRecord>>) {
        let record = Arc::new(Mutex::new(SessionRecord::default()));
        (
            Self {
                record: Arc::clone(&record),
                deliveries: deliveries.into(),
                reject_queues: false,
            },
            record,
        )
    }

    /// Session whose broker refuses every queue declaration, as RabbitMQ does
    /// when an existing queue was declared with other flags.
    pub fn rejecting_queues() -> (Self, Arc<Mutex<SessionRecord>>) {
        let (mut session, record) = Self::new(Vec::new());
        session.reject_queues = true;
        (session, record)
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn declare_exchange(&mut self, exchange: &Exchange) -> stacktach_worker::error::Result<()> {
        self.record.lock().unwrap().exchanges.push(exchange.clone());
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &Queue) -> stacktach_worker::error::Result<()> {
        if self.reject_queues {
            return Err(WorkerError::Connection(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                queue.name
            )));
        }
        self.record.lock().unwrap().queues.push(queue.clone());
        Ok(())
    }

    async fn start_consuming(&mut self, queues: &[Queue]) -> stacktach_worker::error::Result<()> {
        self.record
            .lock()
            .unwrap()
            .consumed
            .extend(queues.iter().map(|q| q.name.clone()));
        Ok(())
    }

    async fn next_delivery(&mut self) -> stacktach_worker::error::Result<Delivery> {
        self.deliveries
            .pop_front()
            .ok_or_else(|| WorkerError::Connection("consumer stream closed".to_string()))
    }

    async fn close(&mut self) {
        self.record.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
pub struct ConnectorState {
    sessions: Mutex<VecDeque<MockSession>>,
    attempts: AtomicUsize,
    brokers: Mutex<Vec<BrokerConfig>>,
}

/// Hands out scripted sessions in order, then refuses connections. Clones
/// share state so a test can inspect it after handing one to a supervisor.
#[derive(Clone, Default)]
pub struct MockConnector(Arc<ConnectorState>);

impl MockConnector {
    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: Vec<MockSession>) -> Self {
        let state = ConnectorState {
            sessions: Mutex::new(sessions.into()),
            ..ConnectorState::default()
        };
        Self(Arc::new(state))
    }

    pub fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    pub fn brokers(&self) -> Vec<BrokerConfig> {
        self.0.brokers.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, broker: &BrokerConfig) -> stacktach_worker::error::Result<MockSession> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        self.0.brokers.lock().unwrap().push(broker.clone());

        self.0
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| WorkerError::Connection("connection refused".to_string()))
    }
}

pub fn settings(exchange: &str, topics: Vec<TopicSubscription>) -> WorkerSettings {
    WorkerSettings {
        name: "east.prod".to_string(),
        exchange: exchange.to_string(),
        broker: BrokerConfig {
            host: "10.0.0.1".to_string(),
            port: 5672,
            userid: "rabbit".to_string(),
            password: "rabbit".to_string(),
            virtual_host: "/".to_string(),
            transport: Transport::Amqp,
        },
        durable: true,
        queue_arguments: Default::default(),
        exit_on_exception: false,
        topics,
        backoff: Duration::from_secs(5),
        memory_sample_interval: Duration::from_secs(30),
    }
}

pub fn test_topics() -> Vec<TopicSubscription> {
    vec![
        TopicSubscription {
            queue: "queue1".to_string(),
            routing_key: "monitor.info".to_string(),
        },
        TopicSubscription {
            queue: "queue2".to_string(),
            routing_key: "monitor.error".to_string(),
        },
    ]
}

/// Predicate that answers true `times` times, then false forever.
pub fn run_times(times: usize) -> impl FnMut() -> bool {
    let mut remaining = times;
    move || {
        if remaining == 0 {
            return false;
        }
        remaining -= 1;
        true
    }
}
