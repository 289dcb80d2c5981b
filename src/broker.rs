use async_trait::async_trait;

use crate::{
    config::BrokerConfig,
    error::Result,
    models::topology::{Exchange, Queue},
};

#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A message as handed over by the broker, before decoding.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

/// One open broker connection with a channel on it.
#[async_trait]
pub trait BrokerSession: Send {
    async fn declare_exchange(&mut self, exchange: &Exchange) -> Result<()>;

    /// Declares the queue and binds it to its exchange with its routing key.
    async fn declare_queue(&mut self, queue: &Queue) -> Result<()>;

    async fn start_consuming(&mut self, queues: &[Queue]) -> Result<()>;

    /// Blocks until the next delivery. A closed stream is a connection error.
    async fn next_delivery(&mut self) -> Result<Delivery>;

    /// Best-effort shutdown before the supervisor backs off.
    async fn close(&mut self) {}
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Session: BrokerSession;

    async fn connect(&self, broker: &BrokerConfig) -> Result<Self::Session>;
}
