//! Producer-side publish path: the typed `send()` APIs.
//!
//! User code never talks to the external transport directly. A `send()` call
//! materializes an envelope, appends one [`TraceStep`] for this hop, encodes
//! it and stages it into `producer_queue` — the producer dispatcher takes it
//! from there. Staging and the wake-up notification happen in one
//! transaction, so the call returns only once the message is durable.
//!
//! Three typed fronts share one [`BrokerPublisher`]:
//!
//! - [`EventBroker`] — facts, multicast, no reply expected.
//! - [`CommandBroker`] — imperative requests, unicast, reply expected.
//! - [`CommandReplyBroker`] — outcomes of command execution, unicast,
//!   continuing the command's trace.

use std::sync::Arc;
use thiserror::Error;
use transit_core::message::{
    BrokerMessage, CodecError, EventData, MessageStatus, MessageStrategy, Trace, TraceStep,
};
use transit_core::request::Context;
use transit_postgres::{ProducerQueue, QueueError};
use uuid::Uuid;

/// Errors raised on the publish path.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The envelope could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The staging insert failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Shared staging writer for all typed brokers.
///
/// Owns the service identity used for trace steps and reply-topic defaults.
/// Thread-safe: concurrent `send()` calls draw distinct connections from the
/// underlying pool.
pub struct BrokerPublisher {
    queue: ProducerQueue,
    service_name: String,
    default_reply_topic: String,
}

impl BrokerPublisher {
    /// Create a publisher staging into the given queue on behalf of the
    /// named service.
    pub fn new(queue: ProducerQueue, service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let default_reply_topic = format!("{service_name}Reply");
        Self {
            queue,
            service_name,
            default_reply_topic,
        }
    }

    /// The service name appended to every outgoing trace.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The reply topic used when neither the caller nor the context names one.
    #[must_use]
    pub fn default_reply_topic(&self) -> &str {
        &self.default_reply_topic
    }

    /// A fresh trace step for this hop.
    pub(crate) fn next_step(&self) -> TraceStep {
        TraceStep::new(Uuid::new_v4(), self.service_name.clone())
    }

    /// Continue the context's trace if one is bound, else start a new chain.
    pub(crate) fn trace_for(&self, ctx: &Context) -> Trace {
        let step = self.next_step();
        match &ctx.trace {
            Some(trace) => trace.extended(step),
            None => Trace::origin(step),
        }
    }

    /// Encode and stage an envelope; returns the `producer_queue` row id.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Codec`] if encoding fails, or
    /// [`PublishError::Queue`] if staging fails.
    pub async fn stage(&self, message: &BrokerMessage) -> Result<i64, PublishError> {
        let encoded = message.encode()?;
        tracing::info!(
            topic = %message.topic,
            identifier = %message.identifier(),
            strategy = message.strategy.as_str(),
            "Sending message"
        );
        let id = self
            .queue
            .enqueue(&message.topic, &encoded, message.strategy)
            .await?;
        Ok(id)
    }
}

/// Publisher for event-kind messages.
pub struct EventBroker {
    publisher: Arc<BrokerPublisher>,
}

impl EventBroker {
    /// Create an event broker over the shared publisher.
    #[must_use]
    pub const fn new(publisher: Arc<BrokerPublisher>) -> Self {
        Self { publisher }
    }

    /// Send an event: a fact about an aggregate, fanned out to every
    /// subscriber group.
    ///
    /// Starts a fresh trace — events produced outside a handled message have
    /// no causal predecessor. Use [`EventBroker::send_in_context`] from
    /// inside a callback.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or staging fails.
    pub async fn send(&self, data: &EventData, topic: &str) -> Result<i64, PublishError> {
        self.send_in_context(data, topic, &Context::default()).await
    }

    /// Send an event continuing the causal chain of the given context.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or staging fails.
    pub async fn send_in_context(
        &self,
        data: &EventData,
        topic: &str,
        ctx: &Context,
    ) -> Result<i64, PublishError> {
        let message = BrokerMessage::new(topic, data.encode()?, self.publisher.trace_for(ctx))
            .with_strategy(MessageStrategy::Multicast);
        self.publisher.stage(&message).await
    }
}

/// Publisher for command-kind messages.
pub struct CommandBroker {
    publisher: Arc<BrokerPublisher>,
}

impl CommandBroker {
    /// Create a command broker over the shared publisher.
    #[must_use]
    pub const fn new(publisher: Arc<BrokerPublisher>) -> Self {
        Self { publisher }
    }

    /// Send a command expecting a reply.
    ///
    /// The reply topic is resolved in priority order: the explicit
    /// `reply_topic` argument, then the context's bound reply topic, then the
    /// service's configured default.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or staging fails.
    pub async fn send(
        &self,
        data: Vec<u8>,
        topic: &str,
        reply_topic: Option<&str>,
        user: Option<Uuid>,
        ctx: &Context,
    ) -> Result<i64, PublishError> {
        let reply_topic = reply_topic
            .map(str::to_string)
            .or_else(|| ctx.reply_topic.clone())
            .unwrap_or_else(|| self.publisher.default_reply_topic().to_string());

        let mut message = BrokerMessage::new(topic, data, self.publisher.trace_for(ctx))
            .with_reply_topic(reply_topic);
        message.user = user.or(ctx.user);

        self.publisher.stage(&message).await
    }
}

/// Publisher for command-reply messages.
pub struct CommandReplyBroker {
    publisher: Arc<BrokerPublisher>,
}

impl CommandReplyBroker {
    /// Create a reply broker over the shared publisher.
    #[must_use]
    pub const fn new(publisher: Arc<BrokerPublisher>) -> Self {
        Self { publisher }
    }

    /// Send the outcome of a command execution.
    ///
    /// Continues the originating command's trace with one step for this hop,
    /// so the originator can correlate the reply with its request chain.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or staging fails.
    pub async fn send(
        &self,
        data: Vec<u8>,
        topic: &str,
        trace: &Trace,
        status: MessageStatus,
    ) -> Result<i64, PublishError> {
        let message = BrokerMessage::new(topic, data, trace.extended(self.publisher.next_step()))
            .with_status(status);
        self.publisher.stage(&message).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn publisher_parts() -> BrokerPublisher {
        // Pool is only needed for staging; trace logic is testable without it.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        BrokerPublisher::new(ProducerQueue::new(pool), "order")
    }

    #[tokio::test]
    async fn default_reply_topic_derives_from_service_name() {
        let publisher = publisher_parts();
        assert_eq!(publisher.default_reply_topic(), "orderReply");
    }

    #[tokio::test]
    async fn trace_starts_fresh_without_context() {
        let publisher = publisher_parts();
        let trace = publisher.trace_for(&Context::default());
        assert_eq!(trace.len(), 1);
        assert_eq!(trace.last().service_name, "order");
    }

    #[tokio::test]
    async fn trace_extends_bound_context() {
        let publisher = publisher_parts();
        let origin = Trace::origin(TraceStep::new(Uuid::from_u128(1), "upstream"));
        let ctx = Context {
            trace: Some(origin),
            ..Context::default()
        };

        let trace = publisher.trace_for(&ctx);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.steps()[0].service_name, "upstream");
        assert_eq!(trace.last().service_name, "order");
    }
}
