// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels with a job inside the AMQP message headers: the
//! publisher injects the current context and the job envelope extracts it on
//! the consumer side. Which headers are written depends on the globally
//! installed text map propagator; with none installed nothing is added.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// An adapter for injecting OpenTelemetry context into RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Read-only view over received headers for context extraction.
pub(crate) struct RabbitMQHeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for RabbitMQHeaderExtractor<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    ///
    /// Only long string values carry propagated context.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the given context into `headers` with the global propagator.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Rebuilds the publisher's context from received headers.
///
/// Messages without headers yield an empty context.
pub(crate) fn extract_context(headers: Option<&FieldTable>) -> Context {
    let empty = BTreeMap::new();
    let headers = headers.map(|h| h.inner()).unwrap_or(&empty);

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQHeaderExtractor { headers })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        RabbitMQTracePropagator::new(&mut headers).set("TraceParent", "00-abc-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&AMQPValue::LongString("00-abc-01".into()))
        );
    }

    #[test]
    fn extractor_reads_only_long_strings() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString("00-abc-01".into()),
        );
        headers.insert(ShortString::from("retries"), AMQPValue::LongInt(3));

        let extractor = RabbitMQHeaderExtractor { headers: &headers };
        assert_eq!(extractor.get("traceparent"), Some("00-abc-01"));
        assert_eq!(extractor.get("retries"), None);
        assert_eq!(extractor.get("missing"), None);

        let mut keys = extractor.keys();
        keys.sort();
        assert_eq!(keys, vec!["retries", "traceparent"]);
    }

    #[test]
    fn extracting_from_no_headers_is_harmless() {
        let _ctx = extract_context(None);
    }
}
