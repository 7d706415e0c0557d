// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Settings consumed by the connection manager, the topology provisioner,
//! the publisher and the consumer. A `BrokerConfig` is built once at startup
//! and shared read-only by every component of a client.
//!
//! Values can be deserialized from any serde source or loaded with
//! [`BrokerConfig::load`], which layers an optional configuration file and
//! `RABBITMQ_*` environment variables on top of the defaults.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT},
};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;

/// Environment variable prefix read by [`BrokerConfig::load`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// When a polled message is acknowledged to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack as soon as the message is fetched, before the caller processes it.
    /// A crash during processing loses the job (at-most-once).
    #[default]
    OnReceipt,
    /// Leave the message unacknowledged until the job is deleted or released
    /// (at-least-once).
    OnCompletion,
}

/// Declaration parameters of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, case-sensitive.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub routing_key: String,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            routing_key: String::new(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
        }
    }
}

impl QueueConfig {
    /// A durable queue named `name`, with every other setting at its default.
    pub fn named(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_owned(),
            ..Default::default()
        }
    }
}

/// Connection, topology and delivery settings for a queue client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Exchange every publish goes through. Empty means the broker's default
    /// exchange, which is never declared nor bound.
    pub exchange: String,
    pub exchange_type: String,
    /// Queue used by `poll` and `size` when the caller names none.
    pub queue: String,
    /// Queues declared and bound by the provisioner.
    ///
    /// A list rather than a map keyed by name: configuration sources
    /// lowercase their keys, and queue names are case-sensitive.
    pub queues: Vec<QueueConfig>,
    pub qos_prefetch_size: u32,
    pub qos_prefetch_count: u16,
    pub qos_global: bool,
    pub persistent: bool,
    /// Routing key used when `publish` is called without a queue.
    pub routing_key: Option<String>,
    pub ack_mode: AckMode,
    pub declare_topology: bool,
    pub connection_name: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            exchange: "default".to_owned(),
            exchange_type: "direct".to_owned(),
            queue: "default".to_owned(),
            queues: Vec::new(),
            qos_prefetch_size: 0,
            qos_prefetch_count: 1,
            qos_global: false,
            persistent: true,
            routing_key: None,
            ack_mode: AckMode::default(),
            declare_topology: true,
            connection_name: None,
        }
    }
}

impl BrokerConfig {
    /// Loads the configuration from an optional file and the environment.
    ///
    /// The file may be any format the `config` crate understands (toml, yaml,
    /// json...). Environment variables such as `RABBITMQ_HOST` or
    /// `RABBITMQ_QOS_PREFETCH_COUNT` override file values; nested queue
    /// settings belong in the file, as an array of tables:
    ///
    /// ```toml
    /// [[queues]]
    /// name = "Orders.New"
    /// routing_key = "new"
    /// ```
    ///
    /// # Errors
    /// * `ConfigError` when a source cannot be read or parsed, or when the
    ///   result fails [`BrokerConfig::validate`]
    pub fn load(path: Option<&str>) -> Result<BrokerConfig, AmqpError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let cfg: BrokerConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the values the connection manager cannot work without.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.trim().is_empty() {
            return Err(AmqpError::ConfigError("host must not be empty".to_owned()));
        }

        if self.port == 0 {
            return Err(AmqpError::ConfigError("port must not be zero".to_owned()));
        }

        if self.qos_prefetch_count == 0 {
            return Err(AmqpError::ConfigError(
                "qos_prefetch_count must be at least 1".to_owned(),
            ));
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(AmqpError::ConfigError(
                    "queue names must not be empty".to_owned(),
                ));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(AmqpError::ConfigError(format!(
                    "queue `{}` is configured twice",
                    queue.name
                )));
            }
        }

        Ok(())
    }

    /// Declaration parameters of the configured queue named `name`.
    pub fn queue_config(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Parsed form of `exchange_type`.
    pub fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::from(self.exchange_type.as_str())
    }

    /// AMQP delivery mode for outgoing messages: 2 persistent, 1 transient.
    pub fn delivery_mode(&self) -> u8 {
        if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        }
    }

    /// Routing key for a publish, falling back from the explicit queue to the
    /// configured default key and finally to the empty key.
    pub fn resolve_routing_key<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.or(self.routing_key.as_deref()).unwrap_or_default()
    }

    /// Queue name for a poll or size query.
    pub fn resolve_queue<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.queue)
    }

    /// `host:port`, used in logs and errors. Credentials are never included.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_contract() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.qos_prefetch_count, 1);
        assert_eq!(cfg.qos_prefetch_size, 0);
        assert!(!cfg.qos_global);
        assert!(cfg.persistent);
        assert_eq!(cfg.delivery_mode(), 2);
        assert_eq!(cfg.ack_mode, AckMode::OnReceipt);
        assert_eq!(cfg.exchange_kind(), ExchangeKind::Direct);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn queue_defaults_are_durable_and_shared() {
        let q = QueueConfig::named("jobs");
        assert_eq!(q.name, "jobs");
        assert!(q.durable);
        assert!(!q.exclusive);
        assert!(!q.auto_delete);
        assert_eq!(q.routing_key, "");
    }

    #[test]
    fn routing_key_resolution_order() {
        let mut cfg = BrokerConfig::default();
        assert_eq!(cfg.resolve_routing_key(None), "");
        assert_eq!(cfg.resolve_routing_key(Some("new")), "new");

        cfg.routing_key = Some("fallback".to_owned());
        assert_eq!(cfg.resolve_routing_key(None), "fallback");
        assert_eq!(cfg.resolve_routing_key(Some("new")), "new");
    }

    #[test]
    fn transient_delivery_mode() {
        let cfg = BrokerConfig {
            persistent: false,
            ..Default::default()
        };
        assert_eq!(cfg.delivery_mode(), 1);
    }

    #[test]
    fn validate_rejects_missing_values() {
        let cfg = BrokerConfig {
            host: " ".to_owned(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AmqpError::ConfigError(_))));

        let cfg = BrokerConfig {
            qos_prefetch_count: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let cfg: BrokerConfig = serde_json::from_value(serde_json::json!({
            "host": "rabbit",
            "exchange": "orders",
            "ack_mode": "on_completion",
            "queues": [
                { "name": "orders.new", "routing_key": "new" },
                { "name": "orders.tmp", "durable": false, "auto_delete": true }
            ]
        }))
        .unwrap();

        assert_eq!(cfg.host, "rabbit");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.ack_mode, AckMode::OnCompletion);

        let new = cfg.queue_config("orders.new").unwrap();
        assert_eq!(new.routing_key, "new");
        assert!(new.durable);

        let tmp = cfg.queue_config("orders.tmp").unwrap();
        assert!(!tmp.durable);
        assert!(tmp.auto_delete);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host = "broker.internal"
port = 5673
exchange = "orders"
exchange_type = "topic"
qos_prefetch_count = 10

[[queues]]
name = "orders.new"
routing_key = "orders.*"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_owned();
        let cfg = BrokerConfig::load(Some(&path)).unwrap();

        assert_eq!(cfg.host, "broker.internal");
        assert_eq!(cfg.port, 5673);
        assert_eq!(cfg.exchange_kind(), ExchangeKind::Topic);
        assert_eq!(cfg.qos_prefetch_count, 10);
        assert_eq!(
            cfg.queue_config("orders.new").unwrap().routing_key,
            "orders.*"
        );
    }

    #[test]
    fn file_queue_names_keep_their_case() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
exchange = "Orders"
queue = "Orders.New"

[[queues]]
name = "Orders.New"
routing_key = "New"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_owned();
        let cfg = BrokerConfig::load(Some(&path)).unwrap();

        assert_eq!(cfg.queue, "Orders.New");
        let queue = cfg.queue_config(&cfg.queue).unwrap();
        assert_eq!(queue.name, "Orders.New");
        assert_eq!(queue.routing_key, "New");
    }

    #[test]
    fn validate_rejects_unnamed_and_duplicate_queues() {
        let cfg = BrokerConfig {
            queues: vec![QueueConfig::default()],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AmqpError::ConfigError(_))));

        let cfg = BrokerConfig {
            queues: vec![QueueConfig::named("jobs"), QueueConfig::named("jobs")],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(AmqpError::ConfigError(_))));
    }
}
