// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the broker session of a queue client: one connection and
//! exactly one channel opened on it, with QoS applied. There is no pooling and
//! no reconnection; a failure while connecting is returned to the caller as is.
//!
//! Closing is idempotent and happens channel first, then connection. Dropping
//! an `AmqpConnection` that was not closed schedules the same graceful close on
//! the current tokio runtime and ignores whatever error a broken session
//! reports.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    config::BrokerConfig,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{
    options::BasicQosOptions,
    types::LongString,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, warn};

/// Reply code sent with a normal channel or connection close
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// A connection to RabbitMQ and the single channel opened on it.
pub struct AmqpConnection {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Connects to the broker, opens a channel and applies QoS.
    ///
    /// # Errors
    /// * `ConnectionError` when the broker is unreachable, rejects the
    ///   credentials or does not know the virtual host
    /// * `ChannelError` when the channel cannot be opened
    /// * `QoSDeclarationError` when `basic.qos` fails
    pub async fn connect(cfg: &BrokerConfig) -> Result<AmqpConnection, AmqpError> {
        debug!("creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &cfg.connection_name {
            options = options.with_connection_name(LongString::from(name.as_str()));
        }

        let conn = match Connection::connect_uri(amqp_uri(cfg), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    endpoint = cfg.endpoint(),
                    vhost = cfg.vhost,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError {
                    host: cfg.endpoint(),
                    reason: err.to_string(),
                })
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                abandon(&conn).await;
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        };
        debug!("channel created");

        if let Err(err) = apply_qos(&channel, cfg).await {
            abandon(&conn).await;
            return Err(err);
        }

        Ok(AmqpConnection {
            connection: Arc::new(conn),
            channel: Arc::new(channel),
            closed: AtomicBool::new(false),
        })
    }

    /// The channel shared by the publisher, the consumer and the provisioner.
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// False once closed, or once the broker closed the connection or the
    /// channel. A refused declaration or a `basic.get` on a missing queue
    /// closes the channel.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    /// Closes the channel, then the connection.
    ///
    /// Calling it on an already closed (or broken) session is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        close_session(&self.channel, &self.connection).await
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.connection.create_channel().await {
            Ok(channel) => Ok(Arc::new(channel)),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, amqp connection dropped without close");
            return;
        };

        let channel = self.channel.clone();
        let connection = self.connection.clone();
        runtime.spawn(async move {
            if let Err(err) = close_session(&channel, &connection).await {
                debug!(error = err.to_string(), "ignoring close error on drop");
            }
        });
    }
}

/// Builds the connection URI field by field, so credentials and virtual hosts
/// such as `/` need no percent-encoding.
pub(crate) fn amqp_uri(cfg: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.user.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port,
        },
        vhost: cfg.vhost.clone(),
        ..Default::default()
    }
}

async fn apply_qos(channel: &Channel, cfg: &BrokerConfig) -> Result<(), AmqpError> {
    if cfg.qos_prefetch_size != 0 {
        warn!(
            prefetch_size = cfg.qos_prefetch_size,
            "qos prefetch size is not supported by the broker, using 0"
        );
    }

    channel
        .basic_qos(
            cfg.qos_prefetch_count,
            BasicQosOptions {
                global: cfg.qos_global,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            AmqpError::QoSDeclarationError(err.to_string())
        })?;

    debug!(
        prefetch_count = cfg.qos_prefetch_count,
        global = cfg.qos_global,
        "qos configured"
    );

    Ok(())
}

/// Closes a connection whose session could not be set up. The setup error is
/// what the caller gets, so a close failure is only logged.
async fn abandon(connection: &Connection) {
    if let Err(err) = connection.close(AMQP_REPLY_SUCCESS, "OK").await {
        debug!(error = err.to_string(), "ignoring close error of abandoned connection");
    }
}

async fn close_session(channel: &Channel, connection: &Connection) -> Result<(), AmqpError> {
    if channel.status().connected() {
        if let Err(err) = channel.close(AMQP_REPLY_SUCCESS, "OK").await {
            // A channel that died in the meantime is as good as closed.
            if channel.status().connected() {
                return Err(AmqpError::CloseError(err.to_string()));
            }
        }
        debug!("channel closed");
    }

    if connection.status().connected() {
        if let Err(err) = connection.close(AMQP_REPLY_SUCCESS, "OK").await {
            if connection.status().connected() {
                return Err(AmqpError::CloseError(err.to_string()));
            }
        }
        debug!("amqp connection closed");
    }

    Ok(())
}
