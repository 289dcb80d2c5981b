use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::models::topology::TopicSubscription;

/// Process-level settings read from the environment.
#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_worker_config")]
    pub worker_config: String,

    pub database_url: String,

    pub worker_deployment: Option<String>,
    pub worker_exchange: Option<String>,

    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    #[serde(default = "default_memory_sample_interval_seconds")]
    pub memory_sample_interval_seconds: u64,

    #[serde(default)]
    pub log_json: bool,
}

fn default_worker_config() -> String {
    "stacktach_worker_config.json".to_string()
}

fn default_prefetch_count() -> u16 {
    100
}

fn default_backoff_seconds() -> u64 {
    5
}

fn default_memory_sample_interval_seconds() -> u64 {
    30
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::from_iter::<_, Self>(vars)
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.database_url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        Ok(config)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds)
    }

    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_secs(self.memory_sample_interval_seconds)
    }
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Amqp,
    Amqps,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub userid: String,
    pub password: String,
    pub virtual_host: String,
    pub transport: Transport,
}

impl BrokerConfig {
    /// Connection target for lapin. Credentials and vhost are carried as
    /// parsed fields, so no escaping is needed.
    pub fn amqp_uri(&self) -> AMQPUri {
        let scheme = match self.transport {
            Transport::Amqp => AMQPScheme::AMQP,
            Transport::Amqps => AMQPScheme::AMQPS,
        };

        AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.userid.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString::default(),
        }
    }
}

/// One entry of the deployment file.
#[derive(Clone, Deserialize, Debug)]
pub struct DeploymentConfig {
    pub name: String,

    #[serde(default = "default_rabbit_host")]
    pub rabbit_host: String,
    #[serde(default = "default_rabbit_port")]
    pub rabbit_port: u16,
    #[serde(default = "default_rabbit_credential")]
    pub rabbit_userid: String,
    #[serde(default = "default_rabbit_credential")]
    pub rabbit_password: String,
    #[serde(default = "default_rabbit_virtual_host")]
    pub rabbit_virtual_host: String,
    #[serde(default)]
    pub rabbit_transport: Transport,

    #[serde(default = "default_true")]
    pub durable_queue: bool,
    #[serde(default)]
    pub queue_arguments: HashMap<String, JsonValue>,
    #[serde(default)]
    pub exit_on_exception: bool,

    #[serde(default)]
    pub topics: HashMap<String, Vec<TopicSubscription>>,
}

fn default_rabbit_host() -> String {
    "localhost".to_string()
}

fn default_rabbit_port() -> u16 {
    5672
}

fn default_rabbit_credential() -> String {
    "rabbit".to_string()
}

fn default_rabbit_virtual_host() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

impl DeploymentConfig {
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.rabbit_host.clone(),
            port: self.rabbit_port,
            userid: self.rabbit_userid.clone(),
            password: self.rabbit_password.clone(),
            virtual_host: self.rabbit_virtual_host.clone(),
            transport: self.rabbit_transport,
        }
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut exchanges = self.topics.keys().cloned().collect::<Vec<_>>();
        exchanges.sort();
        exchanges
    }

    /// Resolved settings for the worker serving `exchange` of this deployment.
    pub fn worker_settings(&self, exchange: &str, config: &Config) -> Result<WorkerSettings, Error> {
        let topics = self.topics.get(exchange).ok_or_else(|| {
            anyhow!(
                "Deployment '{}' has no topics configured for exchange '{}'",
                self.name,
                exchange
            )
        })?;

        Ok(WorkerSettings {
            name: self.name.clone(),
            exchange: exchange.to_string(),
            broker: self.broker(),
            durable: self.durable_queue,
            queue_arguments: self.queue_arguments.clone(),
            exit_on_exception: self.exit_on_exception,
            topics: topics.clone(),
            backoff: config.backoff(),
            memory_sample_interval: config.memory_sample_interval(),
        })
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("Deployment name cannot be empty"));
        }

        for (exchange, topics) in &self.topics {
            for topic in topics {
                if topic.queue.is_empty() || topic.routing_key.is_empty() {
                    return Err(anyhow!(
                        "Deployment '{}' exchange '{}' has a topic with an empty queue or routing key",
                        self.name,
                        exchange
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct WorkerConfig {
    pub deployments: Vec<DeploymentConfig>,
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read worker config {}: {}", path.display(), e))?;

        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let config = serde_json::from_str::<Self>(raw)
            .map_err(|e| anyhow!("Invalid worker config: {}", e))?;

        for deployment in &config.deployments {
            deployment.validate()?;
        }

        Ok(config)
    }
}

/// Everything one (deployment, exchange) worker needs. Immutable for its run.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub name: String,
    pub exchange: String,
    pub broker: BrokerConfig,
    pub durable: bool,
    pub queue_arguments: HashMap<String, JsonValue>,
    pub exit_on_exception: bool,
    pub topics: Vec<TopicSubscription>,
    pub backoff: Duration,
    pub memory_sample_interval: Duration,
}
