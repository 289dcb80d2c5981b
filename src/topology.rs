use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    broker::BrokerSession,
    error::Result,
    models::topology::{Exchange, ExchangeType, Queue, TopicSubscription},
};

/// Derives and declares the exchange/queue layout for one worker. Holds only
/// the caller-supplied flags; every declaration is safe to repeat.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    durable: bool,
    queue_arguments: HashMap<String, JsonValue>,
}

impl TopologyBuilder {
    pub fn new(durable: bool, queue_arguments: HashMap<String, JsonValue>) -> Self {
        Self {
            durable,
            queue_arguments,
        }
    }

    pub fn create_exchange(
        &self,
        name: &str,
        exchange_type: ExchangeType,
        exclusive: bool,
        auto_delete: bool,
    ) -> Exchange {
        Exchange {
            name: name.to_string(),
            exchange_type,
            durable: self.durable,
            exclusive,
            auto_delete,
        }
    }

    pub fn create_queue(
        &self,
        name: &str,
        exchange: &Exchange,
        routing_key: &str,
        exclusive: bool,
        auto_delete: bool,
    ) -> Queue {
        Queue {
            name: name.to_string(),
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_string(),
            durable: self.durable,
            exclusive,
            auto_delete,
            arguments: self.queue_arguments.clone(),
        }
    }

    /// One topic exchange named after the source, one queue per subscription.
    pub fn plan(&self, exchange_name: &str, topics: &[TopicSubscription]) -> (Exchange, Vec<Queue>) {
        let exchange = self.create_exchange(exchange_name, ExchangeType::Topic, false, false);
        let queues = topics
            .iter()
            .map(|topic| self.create_queue(&topic.queue, &exchange, &topic.routing_key, false, false))
            .collect();

        (exchange, queues)
    }

    pub async fn declare<S: BrokerSession + ?Sized>(
        &self,
        session: &mut S,
        exchange_name: &str,
        topics: &[TopicSubscription],
    ) -> Result<Vec<Queue>> {
        let (exchange, queues) = self.plan(exchange_name, topics);

        session.declare_exchange(&exchange).await?;
        debug!(exchange = %exchange.name, durable = exchange.durable, "Exchange declared");

        for queue in &queues {
            session.declare_queue(queue).await?;
            debug!(
                queue = %queue.name,
                exchange = %queue.exchange,
                routing_key = %queue.routing_key,
                "Queue declared and bound"
            );
        }

        info!(
            exchange = %exchange.name,
            queues = queues.len(),
            "Topology declared"
        );

        Ok(queues)
    }
}
