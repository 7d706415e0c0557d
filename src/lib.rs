// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! AMQP 0-9-1 job queue: publishes jobs to RabbitMQ, polls them back one at a
//! time and acknowledges them according to a configurable policy.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod message;
pub mod payload;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use client::RabbitMQQueue;
pub use config::{AckMode, BrokerConfig, QueueConfig};
pub use envelope::{Job, JobEnvelope};
pub use errors::AmqpError;
