use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{
    Stream, StreamExt,
    stream::{self, BoxStream, SelectAll},
};
use lapin::{
    Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    broker::{Acknowledge, BrokerConnector, BrokerSession, Delivery},
    config::BrokerConfig,
    error::{Result, WorkerError},
    models::topology::{Exchange, ExchangeType, Queue},
};

pub struct RabbitMqConnector {
    consumer_tag: String,
    prefetch_count: u16,
}

impl RabbitMqConnector {
    pub fn new(consumer_tag: impl Into<String>, prefetch_count: u16) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            prefetch_count,
        }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    type Session = RabbitMqClient;

    async fn connect(&self, broker: &BrokerConfig) -> Result<RabbitMqClient> {
        RabbitMqClient::connect(broker, &self.consumer_tag, self.prefetch_count).await
    }
}

/// Item of the merged consumer stream. `SelectAll` drops a finished stream
/// without telling anyone, so every consumer ends with an explicit marker.
#[derive(Debug, PartialEq)]
enum ConsumerEvent<T> {
    Item(T),
    Ended(String),
}

fn until_cancelled<S>(queue: &str, consumer: S) -> BoxStream<'static, ConsumerEvent<S::Item>>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let queue = queue.to_string();
    consumer
        .map(ConsumerEvent::Item)
        .chain(stream::once(async move { ConsumerEvent::Ended(queue) }))
        .boxed()
}

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    consumers: SelectAll<BoxStream<'static, ConsumerEvent<lapin::Result<LapinDelivery>>>>,
    consumer_tag: String,
}

impl RabbitMqClient {
    pub async fn connect(
        broker: &BrokerConfig,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<Self> {
        debug!(host = %broker.host, port = broker.port, "Connecting to RabbitMQ");

        let connection =
            Connection::connect_uri(broker.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| {
                    WorkerError::Connection(format!(
                        "Failed to connect to RabbitMQ at {}:{}: {}",
                        broker.host, broker.port, e
                    ))
                })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| WorkerError::Connection(format!("RabbitMQ channel creation failed: {}", e)))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| WorkerError::Connection(format!("Failed to set up QoS: {}", e)))?;

        info!(
            host = %broker.host,
            port = broker.port,
            virtual_host = %broker.virtual_host,
            "RabbitMQ connection established"
        );

        Ok(Self {
            connection,
            channel,
            consumers: SelectAll::new(),
            consumer_tag: consumer_tag.to_string(),
        })
    }
}

#[async_trait]
impl BrokerSession for RabbitMqClient {
    async fn declare_exchange(&mut self, exchange: &Exchange) -> Result<()> {
        let kind = match exchange.exchange_type {
            ExchangeType::Topic => ExchangeKind::Topic,
        };

        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                WorkerError::Connection(format!(
                    "Failed to declare exchange {}: {}",
                    exchange.name, e
                ))
            })?;

        Ok(())
    }

    async fn declare_queue(&mut self, queue: &Queue) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                field_table(&queue.arguments),
            )
            .await
            .map_err(|e| {
                WorkerError::Connection(format!("Failed to declare queue {}: {}", queue.name, e))
            })?;

        self.channel
            .queue_bind(
                &queue.name,
                &queue.exchange,
                &queue.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                WorkerError::Connection(format!(
                    "Failed to bind queue {} to exchange {} with routing key {}: {}",
                    queue.name, queue.exchange, queue.routing_key, e
                ))
            })?;

        Ok(())
    }

    async fn start_consuming(&mut self, queues: &[Queue]) -> Result<()> {
        for queue in queues {
            let consumer = self
                .channel
                .basic_consume(
                    &queue.name,
                    &format!("{}.{}", self.consumer_tag, queue.name),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    WorkerError::Connection(format!(
                        "Failed to create consumer for queue {}: {}",
                        queue.name, e
                    ))
                })?;

            self.consumers.push(until_cancelled(&queue.name, consumer));
        }

        debug!(queues = queues.len(), "Consumers created");

        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery> {
        match self.consumers.next().await {
            Some(ConsumerEvent::Item(Ok(delivery))) => Ok(Delivery {
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
                acker: Box::new(LapinAcker(delivery.acker)),
            }),
            Some(ConsumerEvent::Item(Err(e))) => Err(WorkerError::Connection(format!(
                "Failed to receive delivery: {}",
                e
            ))),
            Some(ConsumerEvent::Ended(queue)) => Err(WorkerError::Connection(format!(
                "Consumer for queue {} was cancelled",
                queue
            ))),
            None => Err(WorkerError::Connection("consumer stream closed".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.connection.close(200, "worker reconnecting").await {
            warn!(error = %e, "Failed to close RabbitMQ connection cleanly");
        }
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| WorkerError::Connection(format!("Failed to acknowledge message: {}", e)))?;

        Ok(())
    }
}

/// Queue arguments from the deployment config as an AMQP argument table.
pub fn field_table(arguments: &HashMap<String, JsonValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &JsonValue) -> AMQPValue {
    match value {
        JsonValue::Null => AMQPValue::Void,
        JsonValue::Bool(b) => AMQPValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        JsonValue::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        JsonValue::Object(map) => {
            let nested = map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>();
            AMQPValue::FieldTable(field_table(&nested))
        }
    }
}
