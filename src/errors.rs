// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Job Queue
//!
//! This module provides the error type shared by every component of the crate.
//! Broker-level failures reported by `lapin` are never passed through as-is:
//! each variant carries the name of the entity involved and the broker message,
//! so the caller can tell which step of the dispatch pipeline failed.

use thiserror::Error;

/// Represents errors that can occur while talking to RabbitMQ.
///
/// Connection-time variants (`ConnectionError`, `ChannelError`,
/// `QoSDeclarationError`) are fatal to the client instance that produced them.
/// Topology variants are logged by the provisioner and never abort startup.
/// Everything else is propagated to the caller without any retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or unreadable configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect to `{host}`: {reason}")]
    ConnectionError { host: String, reason: String },

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare exchange `{name}`: {reason}")]
    DeclareExchangeError { name: String, reason: String },

    /// Error declaring a queue with the given name
    #[error("failure to declare queue `{name}`: {reason}")]
    DeclareQueueError { name: String, reason: String },

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{queue}` to exchange `{exchange}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        reason: String,
    },

    /// Error publishing a message
    #[error("failure to publish to `{exchange}` with key `{routing_key}`: {reason}")]
    PublishingError {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Error fetching a message from a queue
    #[error("failure to poll queue `{queue}`: {reason}")]
    PollError { queue: String, reason: String },

    /// Error reading the state of a queue
    #[error("failure to inspect queue `{queue}`: {reason}")]
    QueueInspectionError { queue: String, reason: String },

    /// Error encoding or decoding a job payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`: {1}")]
    AckMessageError(u64, String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`: {1}")]
    NackMessageError(u64, String),

    /// Error closing a live channel or connection
    #[error("failure to close: {0}")]
    CloseError(String),
}

impl AmqpError {
    /// Returns true for declaration and binding failures.
    ///
    /// These are the errors the topology provisioner records and logs
    /// instead of propagating.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError { .. }
                | AmqpError::DeclareQueueError { .. }
                | AmqpError::BindingExchangeToQueueError { .. }
        )
    }

    /// Returns true for errors raised while establishing the session.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError { .. }
                | AmqpError::ChannelError(_)
                | AmqpError::QoSDeclarationError(_)
        )
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::ParsePayloadError(err.to_string())
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
