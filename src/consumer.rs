// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Job Consumer
//!
//! This module pulls jobs one at a time with `basic.get` and applies the
//! configured acknowledgement policy:
//!
//! - `AckMode::OnReceipt` acks the message before handing it to the caller.
//!   A crash while the job runs loses it.
//! - `AckMode::OnCompletion` leaves the ack (or nack) to the job envelope,
//!   once the caller deletes or releases the job.
//!
//! Attempt counting relies on the `x-death` header the broker maintains on
//! dead-lettered messages.

use crate::{
    broker::BrokerChannel,
    config::{AckMode, BrokerConfig},
    envelope::JobEnvelope,
    errors::AmqpError,
    queue::QueueDefinition,
};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Fetches jobs and reads queue state.
pub struct RabbitMQConsumer {
    channel: Arc<dyn BrokerChannel>,
    cfg: Arc<BrokerConfig>,
}

impl RabbitMQConsumer {
    pub fn new(channel: Arc<dyn BrokerChannel>, cfg: Arc<BrokerConfig>) -> RabbitMQConsumer {
        RabbitMQConsumer { channel, cfg }
    }

    /// Fetches at most one job from `queue` (or the configured default queue).
    ///
    /// Returns immediately with `None` when the queue is empty.
    pub async fn poll(&self, queue: Option<&str>) -> Result<Option<JobEnvelope>, AmqpError> {
        let queue = self.cfg.resolve_queue(queue);

        let Some(message) = self.channel.get(queue).await? else {
            return Ok(None);
        };

        debug!(
            queue = queue,
            delivery_tag = message.delivery_tag(),
            redelivered = message.is_redelivered(),
            "message received"
        );

        if self.cfg.ack_mode == AckMode::OnReceipt {
            if let Err(err) = self.channel.ack(message.delivery_tag()).await {
                error!(error = err.to_string(), "error to ack msg on receipt");
                return Err(err);
            }
        }

        Ok(Some(JobEnvelope::new(
            self.channel.clone(),
            message,
            queue,
            self.cfg.ack_mode,
        )))
    }

    /// Number of ready messages in `queue` (or the configured default queue).
    ///
    /// Uses a passive declaration, which never creates nor alters the queue.
    pub async fn size(&self, queue: Option<&str>) -> Result<u32, AmqpError> {
        let queue = self.cfg.resolve_queue(queue);

        match self
            .channel
            .declare_queue(&QueueDefinition::new(queue).passive())
            .await
        {
            Ok(count) => Ok(count),
            Err(AmqpError::DeclareQueueError { name, reason }) => {
                Err(AmqpError::QueueInspectionError {
                    queue: name,
                    reason,
                })
            }
            Err(err) => Err(err),
        }
    }
}

/// Number of times a message has been delivered, this delivery included.
///
/// Sums the `count` of every `x-death` record (one per queue and reason the
/// message was dead-lettered for) and adds one. Messages that were never
/// dead-lettered count as a first attempt.
pub fn attempts(props: &AMQPProperties) -> u64 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    death_count(&headers).saturating_add(1)
}

fn death_count(headers: &FieldTable) -> u64 {
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|death| death.as_field_table())
        .filter_map(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .filter_map(as_count)
        .fold(0u64, |acc, count| acc.saturating_add(count))
}

/// Reads a non-negative integer of any AMQP width.
fn as_count(value: &AMQPValue) -> Option<u64> {
    let count = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };

    u64::try_from(count).ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, message::Message};
    use lapin::{
        types::{FieldArray, LongString, ShortString},
        BasicProperties,
    };
    use std::collections::BTreeMap;

    pub(crate) fn death_record(queue: &str, reason: &str, count: AMQPValue) -> AMQPValue {
        let mut record = BTreeMap::new();
        record.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        record.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from(reason)),
        );
        record.insert(ShortString::from(AMQP_HEADERS_COUNT), count);
        AMQPValue::FieldTable(FieldTable::from(record))
    }

    pub(crate) fn with_deaths(records: Vec<AMQPValue>) -> BasicProperties {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(records)),
        );
        BasicProperties::default().with_headers(FieldTable::from(headers))
    }

    fn consumer(mock: MockBrokerChannel, ack_mode: AckMode) -> RabbitMQConsumer {
        let cfg = BrokerConfig {
            queue: "jobs".to_owned(),
            ack_mode,
            ..Default::default()
        };
        RabbitMQConsumer::new(Arc::new(mock), Arc::new(cfg))
    }

    #[test]
    fn fresh_message_is_first_attempt() {
        assert_eq!(attempts(&BasicProperties::default()), 1);
    }

    #[test]
    fn headers_without_deaths_are_first_attempt() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("tenant"), AMQPValue::LongInt(1));
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));

        assert_eq!(attempts(&props), 1);
    }

    #[test]
    fn death_counts_are_summed_across_records() {
        let props = with_deaths(vec![
            death_record("orders.new", "rejected", AMQPValue::LongLongInt(2)),
            death_record("orders.new", "expired", AMQPValue::LongLongInt(3)),
        ]);

        assert_eq!(attempts(&props), 6);
    }

    #[test]
    fn any_integer_width_is_counted() {
        let props = with_deaths(vec![
            death_record("a", "rejected", AMQPValue::LongInt(1)),
            death_record("b", "expired", AMQPValue::ShortUInt(2)),
            death_record("c", "maxlen", AMQPValue::LongUInt(4)),
        ]);

        assert_eq!(attempts(&props), 8);
    }

    #[test]
    fn malformed_records_are_ignored() {
        let props = with_deaths(vec![
            death_record("a", "rejected", AMQPValue::LongString("2".into())),
            death_record("b", "rejected", AMQPValue::LongLongInt(-4)),
            AMQPValue::LongInt(9),
            death_record("c", "rejected", AMQPValue::LongLongInt(1)),
        ]);

        assert_eq!(attempts(&props), 2);
    }

    #[tokio::test]
    async fn empty_queue_polls_none() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_get()
            .withf(|queue| queue == "jobs")
            .times(1)
            .returning(|_| Ok(None));
        mock.expect_ack().never();

        let job = consumer(mock, AckMode::OnReceipt).poll(None).await.unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn on_receipt_acks_before_returning() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_get()
            .withf(|queue| queue == "orders.new")
            .times(1)
            .returning(|_| Ok(Some(Message::new(7, br#"{"id":1}"#.to_vec()))));
        mock.expect_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .returning(|_| Ok(()));

        let job = consumer(mock, AckMode::OnReceipt)
            .poll(Some("orders.new"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.raw_body(), br#"{"id":1}"#);
        assert_eq!(job.id(), 7);
        assert_eq!(job.queue(), "orders.new");
        assert_eq!(job.attempts(), 1);
    }

    #[tokio::test]
    async fn on_completion_leaves_message_unacked() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_get()
            .times(1)
            .returning(|_| Ok(Some(Message::new(3, b"x".to_vec()))));
        mock.expect_ack().never();

        let job = consumer(mock, AckMode::OnCompletion).poll(None).await.unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn failed_receipt_ack_is_an_error() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_get()
            .times(1)
            .returning(|_| Ok(Some(Message::new(3, b"x".to_vec()))));
        mock.expect_ack()
            .times(1)
            .returning(|tag| Err(AmqpError::AckMessageError(tag, "channel closed".to_owned())));

        let err = consumer(mock, AckMode::OnReceipt).poll(None).await.unwrap_err();
        assert_eq!(err, AmqpError::AckMessageError(3, "channel closed".to_owned()));
    }

    #[tokio::test]
    async fn poll_errors_are_propagated() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_get().times(1).returning(|queue| {
            Err(AmqpError::PollError {
                queue: queue.to_owned(),
                reason: "NOT_FOUND".to_owned(),
            })
        });

        let err = consumer(mock, AckMode::OnReceipt)
            .poll(Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::PollError { queue, .. } if queue == "missing"));
    }

    #[tokio::test]
    async fn size_uses_a_passive_declaration() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_queue()
            .withf(|def| def.name() == "orders.new" && def.is_passive())
            .times(1)
            .returning(|_| Ok(4));

        let size = consumer(mock, AckMode::OnReceipt)
            .size(Some("orders.new"))
            .await
            .unwrap();
        assert_eq!(size, 4);
    }

    #[tokio::test]
    async fn size_of_unknown_queue_is_an_inspection_error() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_queue().times(1).returning(|def| {
            Err(AmqpError::DeclareQueueError {
                name: def.name().to_owned(),
                reason: "NOT_FOUND".to_owned(),
            })
        });

        let err = consumer(mock, AckMode::OnReceipt).size(None).await.unwrap_err();
        assert_eq!(
            err,
            AmqpError::QueueInspectionError {
                queue: "jobs".to_owned(),
                reason: "NOT_FOUND".to_owned(),
            }
        );
    }
}
