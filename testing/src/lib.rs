//! # Transit Testing
//!
//! Testing utilities for the Transit broker:
//!
//! - [`InMemoryMessageBus`]: a [`MessageBus`] double that records publishes,
//!   routes them to live subscriptions, tracks topic admin operations and
//!   can be switched into a failing mode for retry-path tests.
//! - [`builders`]: envelope and event payload builders for test fixtures.
//! - [`init_tracing`]: opt-in log output for debugging test runs.
//!
//! ## Example
//!
//! ```
//! use transit_testing::InMemoryMessageBus;
//! use transit_core::bus::MessageBus;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = InMemoryMessageBus::new();
//! bus.publish("orders", None, b"payload").await.unwrap();
//! assert_eq!(bus.published("orders"), vec![b"payload".to_vec()]);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use transit_core::bus::{
    BusError, BusFuture, Delivery, IngestStream, MessageBus, SubscriptionControl,
};

struct Subscriber {
    topics: Arc<Mutex<BTreeSet<String>>>,
    tx: mpsc::UnboundedSender<Result<Delivery, BusError>>,
}

#[derive(Default)]
struct BusState {
    published: HashMap<String, Vec<Vec<u8>>>,
    subscribers: Vec<Subscriber>,
    topics: BTreeSet<String>,
    deleted_topics: Vec<String>,
}

/// In-memory [`MessageBus`] for tests.
///
/// Publishes are recorded and routed synchronously to every live
/// subscription whose topic set matches. Admin operations maintain a topic
/// set so tests can assert on topic lifecycle. [`InMemoryMessageBus::fail_publishes`]
/// makes every publish fail, exercising retry accounting.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
    fail_publishes: Arc<AtomicBool>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Payloads published to the given topic, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|state| state.published.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Total number of published payloads across all topics.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.published.values().map(Vec::len).sum())
            .unwrap_or_default()
    }

    /// Whether the topic currently exists (created and not deleted).
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state
            .lock()
            .map(|state| state.topics.contains(topic))
            .unwrap_or_default()
    }

    /// Topics deleted so far, in deletion order.
    #[must_use]
    pub fn deleted_topics(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.deleted_topics.clone())
            .unwrap_or_default()
    }

    fn poisoned() -> BusError {
        BusError::TransportError("bus state poisoned".to_string())
    }
}

struct InMemorySubscription {
    topics: Arc<Mutex<BTreeSet<String>>>,
}

impl SubscriptionControl for InMemorySubscription {
    fn add_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.topics
                .lock()
                .map_err(|_| InMemoryMessageBus::poisoned())?
                .insert(topic);
            Ok(())
        })
    }

    fn remove_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.topics
                .lock()
                .map_err(|_| InMemoryMessageBus::poisoned())?
                .remove(&topic);
            Ok(())
        })
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(&self, topic: &str, _key: Option<&[u8]>, payload: &[u8]) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            if self.fail_publishes.load(Ordering::SeqCst) {
                return Err(BusError::PublishFailed {
                    topic,
                    reason: "bus is in failing mode".to_string(),
                });
            }

            let mut state = self.state.lock().map_err(|_| Self::poisoned())?;
            state
                .published
                .entry(topic.clone())
                .or_default()
                .push(payload.clone());

            for subscriber in &state.subscribers {
                let subscribed = subscriber
                    .topics
                    .lock()
                    .map(|topics| topics.contains(&topic))
                    .unwrap_or(false);
                if subscribed {
                    let _ = subscriber.tx.send(Ok(Delivery {
                        topic: topic.clone(),
                        partition: 0,
                        payload: payload.clone(),
                    }));
                }
            }

            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[String],
        _group_id: &str,
    ) -> BusFuture<'_, (IngestStream, Box<dyn SubscriptionControl>)> {
        let topics: BTreeSet<String> = topics.iter().cloned().collect();

        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let topics = Arc::new(Mutex::new(topics));

            self.state
                .lock()
                .map_err(|_| Self::poisoned())?
                .subscribers
                .push(Subscriber {
                    topics: Arc::clone(&topics),
                    tx,
                });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok((
                Box::pin(stream) as IngestStream,
                Box::new(InMemorySubscription { topics }) as Box<dyn SubscriptionControl>,
            ))
        })
    }

    fn create_topic(&self, topic: &str, _partitions: i32, _replication: i32) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.state
                .lock()
                .map_err(|_| Self::poisoned())?
                .topics
                .insert(topic);
            Ok(())
        })
    }

    fn delete_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().map_err(|_| Self::poisoned())?;
            state.topics.remove(&topic);
            state.deleted_topics.push(topic);
            Ok(())
        })
    }
}

/// Builders for envelope fixtures.
pub mod builders {
    use transit_core::message::{BrokerMessage, EventData, Trace, TraceStep};
    use uuid::Uuid;

    /// A single-step trace originating at the given service.
    #[must_use]
    pub fn trace_from(service_name: &str) -> Trace {
        Trace::origin(TraceStep::new(Uuid::new_v4(), service_name))
    }

    /// A minimal envelope on the given topic.
    #[must_use]
    pub fn message_on(topic: &str, data: Vec<u8>, service_name: &str) -> BrokerMessage {
        BrokerMessage::new(topic, data, trace_from(service_name))
    }

    /// An event payload for the given aggregate and version.
    #[must_use]
    pub fn event_for(uuid: Uuid, version: u32) -> EventData {
        EventData::new(uuid, "TestAggregate", version, vec![])
    }
}

/// Initialize tracing output for a test run. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_routes_to_matching_subscription() {
        let bus = InMemoryMessageBus::new();
        let topics = vec!["orders".to_string()];
        let (mut stream, _control) = bus.subscribe(&topics, "svc").await.unwrap();

        bus.publish("orders", None, b"a").await.unwrap();
        bus.publish("payments", None, b"b").await.unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.topic, "orders");
        assert_eq!(delivery.payload, b"a");
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn dynamic_topics_join_and_leave_subscription() {
        let bus = InMemoryMessageBus::new();
        let (mut stream, control) = bus.subscribe(&[], "svc").await.unwrap();

        control.add_topic("replies").await.unwrap();
        bus.publish("replies", None, b"r1").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().payload, b"r1");

        control.remove_topic("replies").await.unwrap();
        bus.publish("replies", None, b"r2").await.unwrap();

        // Nothing further is delivered for the removed topic.
        let pending = futures::future::poll_immediate(stream.next()).await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn failing_mode_rejects_publishes() {
        let bus = InMemoryMessageBus::new();
        bus.fail_publishes(true);
        let result = bus.publish("orders", None, b"x").await;
        assert!(matches!(result, Err(BusError::PublishFailed { .. })));

        bus.fail_publishes(false);
        assert!(bus.publish("orders", None, b"x").await.is_ok());
    }

    #[tokio::test]
    async fn topic_admin_lifecycle_is_tracked() {
        let bus = InMemoryMessageBus::new();
        bus.create_topic("ephemeral", 1, 1).await.unwrap();
        assert!(bus.topic_exists("ephemeral"));

        bus.delete_topic("ephemeral").await.unwrap();
        assert!(!bus.topic_exists("ephemeral"));
        assert_eq!(bus.deleted_topics(), vec!["ephemeral".to_string()]);
    }
}
