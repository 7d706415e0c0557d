// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchanges, queues and bindings a job queue needs
//! before it publishes or polls anything. Every declaration is idempotent on
//! the broker side, so installing the same topology again is harmless.
//!
//! Installation is best-effort: a declaration the broker refuses (typically a
//! queue that already exists with other parameters) is logged and recorded in
//! the returned [`TopologyReport`], and the remaining entities are still
//! declared. A queue that could not be declared is not bound.
//!
//! A refused declaration or binding is a channel error: the broker closes the
//! channel it was issued on. Provisioning therefore never runs on the channel
//! of the publisher and consumer. It opens its own channel on the connection,
//! replaces it after every refusal and closes it when done.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ
//! - `ensure_topology`: Installs the topology described by a `BrokerConfig`

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, error, info};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology, replacing any queue of the
    /// same name.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings.
    ///
    /// Never fails as a whole; failures are listed in the report.
    async fn install(&self) -> TopologyReport;
}

/// Outcome of a topology installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
    pub failures: Vec<AmqpError>,
}

impl TopologyReport {
    /// True when every declaration and binding succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    connection: Arc<dyn BrokerConnection>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(connection: Arc<dyn BrokerConnection>) -> AmqpTopology {
        AmqpTopology {
            connection,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Builds the topology described by `cfg`.
    ///
    /// The exchange is declared durable and never auto-deleted. Each
    /// configured queue is bound to it with its routing key. With an empty
    /// exchange name the broker's default exchange is used: nothing is
    /// declared for it and no binding is made, since it already routes by
    /// queue name.
    ///
    /// # Parameters
    /// * `connection` - Connection the provisioning channels are opened on
    /// * `cfg` - Exchange and queue settings
    pub fn from_config(connection: Arc<dyn BrokerConnection>, cfg: &BrokerConfig) -> AmqpTopology {
        let mut topology = AmqpTopology::new(connection);
        let use_exchange = !cfg.exchange.is_empty();

        if use_exchange {
            topology = topology.exchange(
                ExchangeDefinition::new(&cfg.exchange)
                    .kind(cfg.exchange_kind())
                    .durable(),
            );
        }

        for queue_cfg in &cfg.queues {
            topology = topology.queue(QueueDefinition::from(queue_cfg));

            if use_exchange {
                topology = topology.queue_binding(
                    QueueBinding::new(&queue_cfg.name)
                        .exchange(&cfg.exchange)
                        .routing_key(&queue_cfg.routing_key),
                );
            }
        }

        topology
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> TopologyReport {
        let mut report = TopologyReport::default();
        let mut channel = ProvisioningChannel::new(self.connection.as_ref());

        if let Err(err) = self.install_on(&mut channel, &mut report).await {
            error!(error = err.to_string(), "failure to open a provisioning channel");
            report.failures.push(err);
        }
        channel.release().await;

        if report.is_complete() {
            info!(
                exchanges = report.exchanges,
                queues = report.queues,
                bindings = report.bindings,
                "topology installed"
            );
        } else {
            error!(
                failures = report.failures.len(),
                "topology installed with failures"
            );
        }

        report
    }
}

impl AmqpTopology {
    /// Fails only when no channel can be opened; refusals go to the report.
    async fn install_on(
        &self,
        channel: &mut ProvisioningChannel<'_>,
        report: &mut TopologyReport,
    ) -> Result<(), AmqpError> {
        self.install_exchanges(channel, report).await?;
        let failed_queues = self.install_queues(channel, report).await?;
        self.binding_queues(channel, &failed_queues, report).await
    }

    async fn install_exchanges(
        &self,
        channel: &mut ProvisioningChannel<'_>,
        report: &mut TopologyReport,
    ) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            let current = channel.get().await?;

            match current.declare_exchange(exch).await {
                Ok(()) => {
                    info!("exchange '{}' has been declared", exch.name);
                    report.exchanges += 1;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    report.failures.push(err);
                    channel.release().await;
                }
            }
        }

        Ok(())
    }

    /// Returns the names of the queues that could not be declared.
    async fn install_queues(
        &self,
        channel: &mut ProvisioningChannel<'_>,
        report: &mut TopologyReport,
    ) -> Result<HashSet<String>, AmqpError> {
        let mut failed = HashSet::new();

        for def in &self.queues {
            let current = channel.get().await?;

            match current.declare_queue(def).await {
                Ok(_) => {
                    info!("queue '{}' has been declared", def.name);
                    report.queues += 1;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = def.name,
                        "error to declare the queue"
                    );
                    failed.insert(def.name.clone());
                    report.failures.push(err);
                    channel.release().await;
                }
            }
        }

        Ok(failed)
    }

    async fn binding_queues(
        &self,
        channel: &mut ProvisioningChannel<'_>,
        failed_queues: &HashSet<String>,
        report: &mut TopologyReport,
    ) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            if failed_queues.contains(&binding.queue_name) {
                error!(
                    queue = binding.queue_name,
                    exchange = binding.exchange_name,
                    "skipping binding of undeclared queue"
                );
                continue;
            }

            let current = channel.get().await?;

            match current.bind_queue(binding).await {
                Ok(()) => {
                    info!(
                        "queue '{}' bound to '{}' with key '{}'",
                        binding.queue_name, binding.exchange_name, binding.routing_key
                    );
                    report.bindings += 1;
                }
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    report.failures.push(err);
                    channel.release().await;
                }
            }
        }

        Ok(())
    }
}

/// The channel provisioning currently runs on, opened on first use.
struct ProvisioningChannel<'a> {
    connection: &'a dyn BrokerConnection,
    current: Option<Arc<dyn BrokerChannel>>,
}

impl<'a> ProvisioningChannel<'a> {
    fn new(connection: &'a dyn BrokerConnection) -> ProvisioningChannel<'a> {
        ProvisioningChannel {
            connection,
            current: None,
        }
    }

    async fn get(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = &self.current {
            return Ok(channel.clone());
        }

        let channel = self.connection.open_channel().await?;
        self.current = Some(channel.clone());
        Ok(channel)
    }

    /// Closes the current channel, if any. The next `get` opens a new one.
    async fn release(&mut self) {
        if let Some(channel) = self.current.take() {
            if let Err(err) = channel.close_channel().await {
                debug!(error = err.to_string(), "ignoring provisioning channel close error");
            }
        }
    }
}

/// Declares the exchange, queues and bindings of `cfg`.
///
/// # Parameters
/// * `connection` - Connection to open the provisioning channels on
/// * `cfg` - Exchange and queue settings
///
/// # Returns
/// What was declared and what the broker refused
pub async fn ensure_topology(
    connection: Arc<dyn BrokerConnection>,
    cfg: &BrokerConfig,
) -> TopologyReport {
    info!(
        exchange = cfg.exchange,
        exchange_type = cfg.exchange_type,
        queues = cfg.queues.len(),
        "ensuring exchange and queues exist"
    );

    AmqpTopology::from_config(connection, cfg).install().await
}
