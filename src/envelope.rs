// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Envelope
//!
//! A `JobEnvelope` is handed to the caller for every polled message. It gives
//! access to the body and broker metadata, and carries the final decision for
//! the job: `delete` when it is done, `release` to have it delivered again.
//!
//! Whether those decisions reach the broker depends on the acknowledgement
//! mode the message was polled with (see [`AckMode`]).

use crate::{
    broker::BrokerChannel, config::AckMode, consumer, errors::AmqpError, message::Message, otel,
    payload::JobPayload,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

/// The contract orchestration code relies on to process a retrieved job.
#[async_trait]
pub trait Job: Send + Sync {
    /// The message body, exactly as published.
    fn raw_body(&self) -> &[u8];

    /// The delivery tag. Scoped to the channel the job was polled on.
    fn id(&self) -> u64;

    /// Deliveries so far, this one included.
    fn attempts(&self) -> u64;

    /// Marks the job as done.
    async fn delete(&mut self) -> Result<(), AmqpError>;

    /// Returns the job to its queue. `delay` is accepted and ignored.
    async fn release(&mut self, delay: Duration) -> Result<(), AmqpError>;

    /// The underlying broker message.
    fn raw_job(&self) -> &Message;
}

/// A polled message bound to the channel and queue it came from.
pub struct JobEnvelope {
    channel: Arc<dyn BrokerChannel>,
    message: Message,
    queue: String,
    ack_mode: AckMode,
    deleted: bool,
    released: bool,
}

impl JobEnvelope {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        message: Message,
        queue: &str,
        ack_mode: AckMode,
    ) -> JobEnvelope {
        JobEnvelope {
            channel,
            message,
            queue: queue.to_owned(),
            ack_mode,
            deleted: false,
            released: false,
        }
    }

    pub fn raw_body(&self) -> &[u8] {
        self.message.data()
    }

    pub fn id(&self) -> u64 {
        self.message.delivery_tag()
    }

    pub fn attempts(&self) -> u64 {
        consumer::attempts(self.message.properties())
    }

    pub fn raw_job(&self) -> &Message {
        &self.message
    }

    /// The queue the job was polled from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Decodes a body published with `publish`.
    pub fn payload(&self) -> Result<JobPayload, AmqpError> {
        JobPayload::from_bytes(self.raw_body())
    }

    /// Trace context propagated by the publisher.
    pub fn trace_context(&self) -> Context {
        otel::extract_context(self.message.properties().headers().as_ref())
    }

    /// Marks the job as finished.
    ///
    /// With `AckMode::OnReceipt` the message was acked when it was polled and
    /// this only records the decision. With `AckMode::OnCompletion` the
    /// message is acked now. Repeated calls, or a delete after a release, do
    /// not reach the broker again.
    pub async fn delete(&mut self) -> Result<(), AmqpError> {
        if self.deleted {
            return Ok(());
        }

        if self.ack_mode == AckMode::OnCompletion && !self.released {
            self.channel.ack(self.id()).await?;
        }

        self.deleted = true;
        debug!(queue = self.queue, delivery_tag = self.id(), "job deleted");
        Ok(())
    }

    /// Hands the job back to its queue for another delivery.
    ///
    /// With `AckMode::OnCompletion` the message is nacked with requeue. With
    /// `AckMode::OnReceipt` the delivery is already acknowledged and cannot be
    /// nacked, so the message is re-published unchanged through the default
    /// exchange straight to its queue. `delay` has no effect. Releasing a job
    /// that was already released or deleted is a no-op.
    pub async fn release(&mut self, delay: Duration) -> Result<(), AmqpError> {
        if self.released || self.deleted {
            return Ok(());
        }

        if !delay.is_zero() {
            debug!(
                delay_ms = delay.as_millis() as u64,
                "release delay is not supported, requeuing immediately"
            );
        }

        match self.ack_mode {
            AckMode::OnCompletion => self.channel.nack(self.id(), true).await?,
            AckMode::OnReceipt => {
                self.channel
                    .publish(
                        "",
                        &self.queue,
                        self.message.data(),
                        self.message.properties().clone(),
                    )
                    .await?
            }
        }

        self.released = true;
        debug!(queue = self.queue, delivery_tag = self.id(), "job released");
        Ok(())
    }
}

impl fmt::Debug for JobEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobEnvelope")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.id())
            .field("ack_mode", &self.ack_mode)
            .field("deleted", &self.deleted)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Job for JobEnvelope {
    fn raw_body(&self) -> &[u8] {
        JobEnvelope::raw_body(self)
    }

    fn id(&self) -> u64 {
        JobEnvelope::id(self)
    }

    fn attempts(&self) -> u64 {
        JobEnvelope::attempts(self)
    }

    async fn delete(&mut self) -> Result<(), AmqpError> {
        JobEnvelope::delete(self).await
    }

    async fn release(&mut self, delay: Duration) -> Result<(), AmqpError> {
        JobEnvelope::release(self, delay).await
    }

    fn raw_job(&self) -> &Message {
        JobEnvelope::raw_job(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        consumer::tests::{death_record, with_deaths},
    };
    use lapin::types::AMQPValue;

    fn envelope(mock: MockBrokerChannel, message: Message, ack_mode: AckMode) -> JobEnvelope {
        JobEnvelope::new(Arc::new(mock), message, "orders.new", ack_mode)
    }

    #[test]
    fn accessors_expose_the_message() {
        let message = Message::new(11, b"payload".to_vec()).with_routing("orders", "new");
        let job = envelope(MockBrokerChannel::new(), message, AckMode::OnReceipt);

        assert_eq!(job.raw_body(), b"payload");
        assert_eq!(job.id(), 11);
        assert_eq!(job.raw_job().exchange(), "orders");
        assert_eq!(job.raw_job().routing_key(), "new");
        assert_eq!(job.attempts(), 1);
        assert!(!job.is_deleted());
        assert!(!job.is_released());
    }

    #[test]
    fn debug_output_names_the_delivery() {
        let job = envelope(
            MockBrokerChannel::new(),
            Message::new(11, b"x".to_vec()),
            AckMode::OnCompletion,
        );
        let debug = format!("{job:?}");

        assert!(debug.starts_with("JobEnvelope {"));
        assert!(debug.contains(r#"queue: "orders.new""#));
        assert!(debug.contains("delivery_tag: 11"));
        assert!(debug.contains("ack_mode: OnCompletion"));

        let polled: Result<Option<JobEnvelope>, AmqpError> = Ok(Some(job));
        assert!(format!("{polled:?}").contains("delivery_tag: 11"));
    }

    #[test]
    fn attempts_come_from_dead_letter_history() {
        let props = with_deaths(vec![
            death_record("orders.new", "rejected", AMQPValue::LongLongInt(2)),
            death_record("orders.retry", "expired", AMQPValue::LongLongInt(3)),
        ]);
        let message = Message::new(1, b"x".to_vec()).with_properties(props);
        let job = envelope(MockBrokerChannel::new(), message, AckMode::OnReceipt);

        assert_eq!(job.attempts(), 6);
    }

    #[tokio::test]
    async fn delete_on_receipt_is_local_only() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_ack().never();
        mock.expect_nack().never();

        let mut job = envelope(mock, Message::new(1, b"x".to_vec()), AckMode::OnReceipt);
        job.delete().await.unwrap();
        job.delete().await.unwrap();

        assert!(job.is_deleted());
    }

    #[tokio::test]
    async fn delete_on_completion_acks_once() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_ack()
            .withf(|tag| *tag == 5)
            .times(1)
            .returning(|_| Ok(()));

        let mut job = envelope(mock, Message::new(5, b"x".to_vec()), AckMode::OnCompletion);
        job.delete().await.unwrap();
        job.delete().await.unwrap();

        assert!(job.is_deleted());
    }

    #[tokio::test]
    async fn release_on_completion_nacks_with_requeue() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_nack()
            .withf(|tag, requeue| *tag == 5 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_ack().never();

        let mut job = envelope(mock, Message::new(5, b"x".to_vec()), AckMode::OnCompletion);
        job.release(Duration::from_secs(30)).await.unwrap();
        job.release(Duration::ZERO).await.unwrap();
        job.delete().await.unwrap();

        assert!(job.is_released());
    }

    #[tokio::test]
    async fn release_on_receipt_republishes_to_origin_queue() {
        let props = with_deaths(vec![death_record(
            "orders.new",
            "rejected",
            AMQPValue::LongLongInt(1),
        )]);
        let expected = props.clone();

        let mut mock = MockBrokerChannel::new();
        mock.expect_publish()
            .withf(move |exchange, routing_key, payload, sent| {
                exchange.is_empty()
                    && routing_key == "orders.new"
                    && payload == b"job".as_slice()
                    && sent.headers() == expected.headers()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        mock.expect_nack().never();

        let message = Message::new(9, b"job".to_vec()).with_properties(props);
        let mut job = envelope(mock, message, AckMode::OnReceipt);
        job.release(Duration::from_secs(10)).await.unwrap();
        job.release(Duration::from_secs(10)).await.unwrap();

        assert!(job.is_released());
    }

    #[tokio::test]
    async fn release_after_delete_is_a_no_op() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_publish().never();

        let mut job = envelope(mock, Message::new(2, b"x".to_vec()), AckMode::OnReceipt);
        job.delete().await.unwrap();
        job.release(Duration::ZERO).await.unwrap();

        assert!(!job.is_released());
    }

    #[tokio::test]
    async fn failed_release_can_be_retried() {
        let mut mock = MockBrokerChannel::new();
        let mut calls = 0;
        mock.expect_nack().times(2).returning(move |tag, _| {
            calls += 1;
            if calls == 1 {
                Err(AmqpError::NackMessageError(tag, "timeout".to_owned()))
            } else {
                Ok(())
            }
        });

        let mut job = envelope(mock, Message::new(4, b"x".to_vec()), AckMode::OnCompletion);
        assert!(job.release(Duration::ZERO).await.is_err());
        assert!(!job.is_released());

        job.release(Duration::ZERO).await.unwrap();
        assert!(job.is_released());
    }

    #[tokio::test]
    async fn job_trait_object_drives_the_envelope() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_ack().times(1).returning(|_| Ok(()));

        let mut job: Box<dyn Job> = Box::new(envelope(
            mock,
            Message::new(8, b"x".to_vec()),
            AckMode::OnCompletion,
        ));

        assert_eq!(job.id(), 8);
        assert_eq!(job.attempts(), 1);
        job.delete().await.unwrap();
    }

    #[test]
    fn payload_decodes_published_jobs() {
        let payload = JobPayload::new("SendInvoice", &serde_json::json!({"id": 1})).unwrap();
        let message = Message::new(1, payload.to_bytes().unwrap());
        let job = envelope(MockBrokerChannel::new(), message, AckMode::OnReceipt);

        assert_eq!(job.payload().unwrap(), payload);
    }
}
