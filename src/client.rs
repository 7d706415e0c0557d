// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Job Queue Client
//!
//! `RabbitMQQueue` is the entry point of the crate. It owns one broker
//! connection with a single working channel and threads that channel through
//! the publisher and the consumer. The topology provisioner opens channels of
//! its own on the same connection.
//!
//! One client is one channel: AMQP methods on a channel are processed
//! sequentially, so a client must not be used from several tasks at once
//! without external synchronization. Create one client per worker instead.
//!
//! ```ignore
//! let queue = RabbitMQQueue::connect(BrokerConfig::load(Some("rabbitmq"))?).await?;
//!
//! queue.publish("SendInvoice", &invoice, Some("orders.new")).await?;
//!
//! if let Some(mut job) = queue.poll(Some("orders.new")).await? {
//!     handle(job.payload()?)?;
//!     job.delete().await?;
//! }
//!
//! queue.close().await?;
//! ```

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    channel::AmqpConnection,
    config::BrokerConfig,
    consumer::RabbitMQConsumer,
    envelope::JobEnvelope,
    errors::AmqpError,
    payload::JobPayload,
    publisher::{PublishOptions, RabbitMQPublisher},
    topology::{ensure_topology, TopologyReport},
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// A job queue backed by a single RabbitMQ channel.
pub struct RabbitMQQueue {
    cfg: Arc<BrokerConfig>,
    owned: Option<Arc<AmqpConnection>>,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    publisher: RabbitMQPublisher,
    consumer: RabbitMQConsumer,
}

impl RabbitMQQueue {
    /// Connects to the broker and, when `declare_topology` is set, installs
    /// the configured exchange, queues and bindings.
    ///
    /// Topology failures are logged and do not fail the connection.
    pub async fn connect(cfg: BrokerConfig) -> Result<RabbitMQQueue, AmqpError> {
        cfg.validate()?;

        let owned = Arc::new(AmqpConnection::connect(&cfg).await?);
        info!(
            endpoint = cfg.endpoint(),
            vhost = cfg.vhost,
            "rabbitmq channel registered"
        );

        let channel: Arc<dyn BrokerChannel> = owned.channel();
        let connection: Arc<dyn BrokerConnection> = owned.clone();
        let queue = Self::build(cfg, Some(owned), connection, channel);

        if queue.cfg.declare_topology {
            queue.ensure_topology().await;
        }

        Ok(queue)
    }

    /// Builds a client on a connection and channel whose lifecycle the
    /// caller manages.
    ///
    /// # Parameters
    /// * `cfg` - Queue settings; connection settings are not used
    /// * `connection` - Source of the provisioning channels
    /// * `channel` - Working channel of the publisher and the consumer
    ///
    /// No topology is declared; call [`RabbitMQQueue::ensure_topology`] if
    /// needed. `close` is a no-op on such a client.
    pub fn with_channel(
        cfg: BrokerConfig,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) -> RabbitMQQueue {
        Self::build(cfg, None, connection, channel)
    }

    fn build(
        cfg: BrokerConfig,
        owned: Option<Arc<AmqpConnection>>,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) -> RabbitMQQueue {
        let cfg = Arc::new(cfg);

        RabbitMQQueue {
            publisher: RabbitMQPublisher::new(channel.clone(), cfg.clone()),
            consumer: RabbitMQConsumer::new(channel.clone(), cfg.clone()),
            cfg,
            owned,
            connection,
            channel,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    /// The owned connection, if this client opened one.
    pub fn connection(&self) -> Option<&AmqpConnection> {
        self.owned.as_deref()
    }

    /// Declares the configured exchange, queues and bindings.
    ///
    /// Runs on provisioning channels, so a refused declaration leaves the
    /// working channel open.
    pub async fn ensure_topology(&self) -> TopologyReport {
        ensure_topology(self.connection.clone(), &self.cfg).await
    }

    /// Number of ready jobs in `queue`, or in the configured default queue.
    pub async fn size(&self, queue: Option<&str>) -> Result<u32, AmqpError> {
        self.consumer.size(queue).await
    }

    /// Wraps `data` in a [`JobPayload`] for the handler named `job` and
    /// publishes it. Returns the job uuid.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        job: &str,
        data: &T,
        queue: Option<&str>,
    ) -> Result<String, AmqpError> {
        let payload = JobPayload::new(job, data)?;
        self.publisher
            .publish(queue, &payload, &PublishOptions::default())
            .await
    }

    /// Publishes an already built payload with explicit options.
    pub async fn publish_payload(
        &self,
        payload: &JobPayload,
        queue: Option<&str>,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        self.publisher.publish(queue, payload, options).await
    }

    /// Publishes `payload` as is. Returns the message id.
    pub async fn publish_raw(
        &self,
        payload: &[u8],
        queue: Option<&str>,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        self.publisher.publish_raw(queue, payload, options).await
    }

    /// Same as [`RabbitMQQueue::publish`]: there is no delayed delivery, the
    /// job is published right away.
    pub async fn schedule_later<T: Serialize + ?Sized>(
        &self,
        delay: Duration,
        job: &str,
        data: &T,
        queue: Option<&str>,
    ) -> Result<String, AmqpError> {
        let payload = JobPayload::new(job, data)?;
        self.publisher
            .schedule_later(delay, queue, &payload, &PublishOptions::default())
            .await
    }

    /// Fetches the next job of `queue`, or of the configured default queue.
    pub async fn poll(&self, queue: Option<&str>) -> Result<Option<JobEnvelope>, AmqpError> {
        self.consumer.poll(queue).await
    }

    /// Closes the owned channel and connection. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match &self.owned {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}
