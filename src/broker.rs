// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Operations
//!
//! The `BrokerChannel` trait lists every AMQP method the job queue issues on
//! its channel. The topology provisioner, the publisher, the consumer and the
//! job envelope only talk to the broker through it, so they work the same
//! against a `lapin::Channel` or a mock.
//!
//! `BrokerConnection` hands out extra channels on the same connection. The
//! provisioner declares topology on those, since the broker closes a channel
//! that had a declaration refused.
//!
//! Implementations translate `lapin` errors into `AmqpError` variants that
//! name the entity involved. None of them retries.

use crate::{
    channel::AMQP_REPLY_SUCCESS,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueBindOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Opens channels on an established connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// `channel.open`
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// The channel-level AMQP operations of a job queue.
///
/// A channel processes its methods sequentially; implementations are not
/// expected to be safe for interleaved use from concurrent tasks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// `exchange.declare`
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// `queue.declare`, returning the number of ready messages.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, AmqpError>;

    /// `queue.bind`
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// `basic.publish` without waiting for a publisher confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// `basic.get` with explicit acknowledgement. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Message>, AmqpError>;

    /// `basic.ack` of a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// `basic.nack` of a single delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// `channel.close`. A channel the broker already closed is left alone.
    async fn close_channel(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("declaring exchange: {}", def.name);

        self.exchange_declare(
            &def.name,
            lapin::ExchangeKind::from(&def.kind),
            def.options(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| AmqpError::DeclareExchangeError {
            name: def.name.clone(),
            reason: err.to_string(),
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, AmqpError> {
        debug!("declaring queue: {}", def.name);

        self.queue_declare(&def.name, def.options(), def.arguments())
            .await
            .map(|queue| queue.message_count())
            .map_err(|err| AmqpError::DeclareQueueError {
                name: def.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| AmqpError::BindingExchangeToQueueError {
            exchange: binding.exchange_name.clone(),
            queue: binding.queue_name.clone(),
            reason: err.to_string(),
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        // The returned confirm is dropped: publishing is fire-and-forget.
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    reason: err.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn get(&self, queue: &str) -> Result<Option<Message>, AmqpError> {
        match self
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(msg) => Ok(msg.map(Message::from)),
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to get message");
                Err(AmqpError::PollError {
                    queue: queue.to_owned(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag, err.to_string())
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError(delivery_tag, err.to_string())
        })
    }

    async fn close_channel(&self) -> Result<(), AmqpError> {
        if !self.status().connected() {
            return Ok(());
        }

        self.close(AMQP_REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}
