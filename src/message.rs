// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Received Messages
//!
//! A `Message` is what `basic.get` hands back: the payload bytes, the AMQP
//! properties the publisher set (headers included) and the broker-assigned
//! delivery metadata.

use lapin::{message::BasicGetMessage, BasicProperties};

/// AMQP delivery mode of a transient message
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// AMQP delivery mode of a persistent message
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// A message fetched from a queue.
///
/// The delivery tag is unique among the unacknowledged messages of one
/// channel only. It is not stable across reconnects.
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) delivery_tag: u64,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) redelivered: bool,
    pub(crate) properties: BasicProperties,
    pub(crate) data: Vec<u8>,
    pub(crate) message_count: u32,
}

impl Message {
    pub fn new(delivery_tag: u64, data: impl Into<Vec<u8>>) -> Self {
        Message {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.into(),
            message_count: 0,
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_routing(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the broker delivered this message before.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Messages still ready in the queue when this one was fetched.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn delivery_mode(&self) -> Option<u8> {
        *self.properties.delivery_mode()
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT)
    }
}

impl From<BasicGetMessage> for Message {
    fn from(msg: BasicGetMessage) -> Self {
        let delivery = msg.delivery;
        Message {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            message_count: msg.message_count,
        }
    }
}
