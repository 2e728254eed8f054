//! Message bus abstraction over the external publish/subscribe transport.
//!
//! The broker core stages everything through relational queues; the
//! [`MessageBus`] trait is the seam to the external transport that actually
//! moves bytes between services (Kafka in production, an in-memory double in
//! tests).
//!
//! # Contract
//!
//! - `publish(topic, key, payload)` delivers at-least-once with per-partition
//!   ordering for a fixed key.
//! - `subscribe(topics, group_id)` yields every delivered message for the
//!   subscriber group; the returned [`SubscriptionControl`] lets the consumer
//!   ingester add and remove topics on the live subscription (used by the
//!   dynamic reply pool).
//! - `create_topic` / `delete_topic` are admin operations for ephemeral
//!   reply topics.
//!
//! # Dyn compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the bus can be shared as `Arc<dyn MessageBus>` across the producer
//! dispatcher, the consumer ingester and the dynamic pool.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the transport.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic.
    #[error("publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to a topic set.
    #[error("subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// An admin operation on a topic failed.
    #[error("admin operation failed for topic '{topic}': {reason}")]
    AdminFailed {
        /// The topic the operation targeted.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Network or transport error while consuming.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// One message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message arrived on.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Raw payload bytes (an encoded envelope).
    pub payload: Vec<u8>,
}

/// Stream of deliveries from a subscription.
pub type IngestStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Boxed future alias used by the dyn-compatible trait methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// Handle to a live subscription whose topic set can change.
///
/// The consumer ingester holds one of these; the dynamic reply pool calls
/// through it when leasing and tearing down reply topics.
pub trait SubscriptionControl: Send + Sync {
    /// Add a topic to the live subscription.
    fn add_topic(&self, topic: &str) -> BusFuture<'_, ()>;

    /// Remove a topic from the live subscription.
    ///
    /// Messages already staged from the removed topic are still drained from
    /// the consumer queue; only future deliveries stop.
    fn remove_topic(&self, topic: &str) -> BusFuture<'_, ()>;
}

/// The external publish/subscribe transport.
pub trait MessageBus: Send + Sync {
    /// Publish raw bytes to a topic.
    ///
    /// A `Some(key)` pins the message to one partition (per-key ordering);
    /// `None` lets the transport's partitioner fan messages out.
    fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> BusFuture<'_, ()>;

    /// Subscribe to a topic set with the given subscriber group id.
    ///
    /// Returns the delivery stream plus a [`SubscriptionControl`] for dynamic
    /// topic changes.
    fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BusFuture<'_, (IngestStream, Box<dyn SubscriptionControl>)>;

    /// Create a topic with the given partition count and replication factor.
    fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> BusFuture<'_, ()>;

    /// Delete a topic.
    fn delete_topic(&self, topic: &str) -> BusFuture<'_, ()>;
}
