// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Job Publisher
//!
//! This module publishes jobs to the configured exchange. Messages carry the
//! configured delivery mode, a fresh message id, optional caller headers and
//! the OpenTelemetry context of the caller.
//!
//! Publishing is fire-and-forget: once `basic.publish` is written to the
//! channel the call returns, without waiting for a broker confirmation.

use crate::{
    broker::BrokerChannel, config::BrokerConfig, errors::AmqpError, otel, payload::JobPayload,
};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Typed values accepted as custom message headers.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Bool(bool),
}

/// Per-message publishing options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: Option<HashMap<String, HeaderValues>>,
    pub content_type: Option<String>,
    pub message_type: Option<String>,
}

impl PublishOptions {
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::default)
            .insert(key.to_owned(), value);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }
}

/// Publishes jobs through the configured exchange.
pub struct RabbitMQPublisher {
    channel: Arc<dyn BrokerChannel>,
    cfg: Arc<BrokerConfig>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, cfg: Arc<BrokerConfig>) -> RabbitMQPublisher {
        RabbitMQPublisher { channel, cfg }
    }

    /// Serializes `payload` as JSON and publishes it.
    ///
    /// The routing key is `queue`, else the configured `routing_key`, else
    /// empty. Returns the message id, which is the job uuid.
    pub async fn publish(
        &self,
        queue: Option<&str>,
        payload: &JobPayload,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        let bytes = payload.to_bytes()?;
        let content_type = options.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE);

        self.send(queue, &bytes, options, &payload.uuid, Some(content_type))
            .await?;

        Ok(payload.uuid.clone())
    }

    /// Publishes `payload` untouched. Returns the generated message id.
    pub async fn publish_raw(
        &self,
        queue: Option<&str>,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        let message_id = Uuid::new_v4().to_string();

        self.send(
            queue,
            payload,
            options,
            &message_id,
            options.content_type.as_deref(),
        )
        .await?;

        Ok(message_id)
    }

    /// Publishes immediately: the broker offers no native delayed delivery,
    /// so `delay` is logged and ignored.
    pub async fn schedule_later(
        &self,
        delay: Duration,
        queue: Option<&str>,
        payload: &JobPayload,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        warn!(
            delay_ms = delay.as_millis() as u64,
            job = payload.job,
            "delayed delivery is not supported, publishing immediately"
        );

        self.publish(queue, payload, options).await
    }

    async fn send(
        &self,
        queue: Option<&str>,
        payload: &[u8],
        options: &PublishOptions,
        message_id: &str,
        content_type: Option<&str>,
    ) -> Result<(), AmqpError> {
        let routing_key = self.cfg.resolve_routing_key(queue);
        let properties = self.properties(options, message_id, content_type);

        debug!(
            exchange = self.cfg.exchange,
            routing_key = routing_key,
            message_id = message_id,
            "publishing message"
        );

        self.channel
            .publish(&self.cfg.exchange, routing_key, payload, properties)
            .await
    }

    fn properties(
        &self,
        options: &PublishOptions,
        message_id: &str,
        content_type: Option<&str>,
    ) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut btree);

        if let Some(headers) = &options.headers {
            self.btree_map(headers, &mut btree);
        }

        let mut properties = BasicProperties::default()
            .with_delivery_mode(self.cfg.delivery_mode())
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(btree));

        if let Some(content_type) = content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }

        if let Some(kind) = &options.message_type {
            properties = properties.with_type(ShortString::from(kind.as_str()));
        }

        properties
    }

    /// Converts caller headers into AMQP field values.
    fn btree_map(
        &self,
        hash_map: &HashMap<String, HeaderValues>,
        btree: &mut BTreeMap<ShortString, AMQPValue>,
    ) {
        for (key, value) in hash_map {
            let amqp_value = match value {
                HeaderValues::ShortString(v) => {
                    AMQPValue::ShortString(ShortString::from(v.as_str()))
                }
                HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v.as_str())),
                HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
                HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
                HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
                HeaderValues::Uint(v) => AMQPValue::ShortUInt(*v),
                HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
                HeaderValues::Bool(v) => AMQPValue::Boolean(*v),
            };

            btree.insert(ShortString::from(key.as_str()), amqp_value);
        }
    }
}
