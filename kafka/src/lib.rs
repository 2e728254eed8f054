//! Kafka transport implementation for the Transit broker.
//!
//! This crate provides [`KafkaMessageBus`], the production implementation of
//! the [`MessageBus`] trait from `transit-core`. It uses rdkafka for
//! Kafka-compatible publish/subscribe and admin operations.
//!
//! # Delivery semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the delivery has been handed to the
//!   ingester's channel
//! - If the process crashes before commit, messages are redelivered
//! - The staging queue downstream must therefore tolerate duplicates
//! - Ordering is guaranteed within a partition; unicast publishes are keyed
//!   so one partition observes them in order
//!
//! # Dynamic topics
//!
//! The subscription returned by [`MessageBus::subscribe`] can be grown and
//! shrunk while live: the dynamic reply pool adds a freshly created reply
//! topic before sending a request and removes it when the lease is torn
//! down. Topic creation and deletion go through the Kafka admin API.
//!
//! # Example
//!
//! ```no_run
//! use transit_kafka::KafkaMessageBus;
//! use transit_core::bus::MessageBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaMessageBus::new("localhost:9092")?;
//!
//! bus.publish("TicketAdded", None, b"payload").await?;
//!
//! let topics = vec!["TicketAdded".to_string()];
//! let (mut stream, _control) = bus.subscribe(&topics, "ticket-service").await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(delivery) => println!("Received on {}", delivery.topic),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use transit_core::bus::{
    BusError, BusFuture, Delivery, IngestStream, MessageBus, SubscriptionControl,
};

/// Kafka message bus.
///
/// Holds one shared [`FutureProducer`] for publishing and one
/// [`AdminClient`] for topic management; each [`MessageBus::subscribe`] call
/// creates its own [`StreamConsumer`].
pub struct KafkaMessageBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Admin client for topic create/delete
    admin: AdminClient<DefaultClientContext>,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer send timeout
    timeout: Duration,
    /// Delivery buffer size for subscriptions
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl KafkaMessageBus {
    /// Create a new Kafka bus with default configuration.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated broker addresses (e.g. "localhost:9092")
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer or admin client
    /// cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> KafkaMessageBusBuilder {
        KafkaMessageBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`KafkaMessageBus`].
#[derive(Default)]
pub struct KafkaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl KafkaMessageBusBuilder {
    /// Set the broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the delivery buffer size for subscriptions.
    ///
    /// Controls how many deliveries can queue between the Kafka consumer and
    /// the ingester before backpressure applies.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set where new subscriber groups start reading: "earliest" or "latest".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`KafkaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are not set or a
    /// client cannot be created.
    pub fn build(self) -> Result<KafkaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            BusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| {
                BusError::ConnectionFailed(format!("Failed to create admin client: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            "KafkaMessageBus created successfully"
        );

        Ok(KafkaMessageBus {
            producer,
            admin,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

/// Live-subscription handle: re-subscribes the consumer on topic changes.
struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    topics: Mutex<BTreeSet<String>>,
}

impl KafkaSubscription {
    async fn resubscribe(&self, topics: &BTreeSet<String>) -> Result<(), BusError> {
        if topics.is_empty() {
            self.consumer.unsubscribe();
            return Ok(());
        }
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| BusError::SubscriptionFailed {
                topics: topics.iter().cloned().collect(),
                reason: format!("Failed to re-subscribe: {e}"),
            })
    }
}

impl SubscriptionControl for KafkaSubscription {
    fn add_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut topics = self.topics.lock().await;
            topics.insert(topic.clone());
            tracing::debug!(topic = %topic, total = topics.len(), "Topic added to subscription");
            self.resubscribe(&topics).await
        })
    }

    fn remove_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut topics = self.topics.lock().await;
            topics.remove(&topic);
            tracing::debug!(topic = %topic, total = topics.len(), "Topic removed from subscription");
            self.resubscribe(&topics).await
        })
    }
}

impl MessageBus for KafkaMessageBus {
    fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        let key = key.map(<[u8]>::to_vec);
        let payload = payload.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut record = FutureRecord::to(&topic).payload(&payload);
            if let Some(key) = &key {
                record = record.key(key);
            }

            let send_result = self.producer.send(record, Timeout::After(timeout)).await;

            match send_result {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        keyed = key.is_some(),
                        "Message published successfully"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(BusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BusFuture<'_, (IngestStream, Box<dyn SubscriptionControl>)> {
        let topics: Vec<String> = topics.to_vec();
        let group_id = group_id.to_string();
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            // Manual commit for at-least-once delivery into the staging queue.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let consumer = Arc::new(consumer);

            if !topics.is_empty() {
                let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer
                    .subscribe(&topic_refs)
                    .map_err(|e| BusError::SubscriptionFailed {
                        topics: topics.clone(),
                        reason: format!("Failed to subscribe to topics: {e}"),
                    })?;
            }

            tracing::info!(
                topics = ?topics,
                group_id = %group_id,
                buffer_size,
                manual_commit = true,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The forwarding task owns a clone of the consumer handle; the
            // SubscriptionControl holds another for live re-subscription.
            let task_consumer = Arc::clone(&consumer);
            tokio::spawn(async move {
                loop {
                    match task_consumer.recv().await {
                        Ok(message) => {
                            let delivery = message.payload().map_or_else(
                                || {
                                    Err(BusError::TransportError(
                                        "Message has no payload".to_string(),
                                    ))
                                },
                                |payload| {
                                    Ok(Delivery {
                                        topic: message.topic().to_string(),
                                        partition: message.partition(),
                                        payload: payload.to_vec(),
                                    })
                                },
                            );

                            // Commit only AFTER the delivery reached the channel:
                            // a crash before commit means redelivery, never loss.
                            if tx.send(delivery).await.is_err() {
                                tracing::debug!("Delivery receiver dropped, exiting consumer task");
                                break;
                            }

                            if let Err(e) =
                                task_consumer.commit_message(&message, CommitMode::Async)
                            {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        }
                        Err(e) => {
                            let err = BusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            let control = KafkaSubscription {
                consumer,
                topics: Mutex::new(topics.into_iter().collect()),
            };

            Ok((
                Box::pin(stream) as IngestStream,
                Box::new(control) as Box<dyn SubscriptionControl>,
            ))
        })
    }

    fn create_topic(&self, topic: &str, partitions: i32, replication: i32) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let new_topic = NewTopic::new(&topic, partitions, TopicReplication::Fixed(replication));
            let results = self
                .admin
                .create_topics([&new_topic], &AdminOptions::new())
                .await
                .map_err(|e| BusError::AdminFailed {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;

            for result in results {
                match result {
                    Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                    Err((name, code)) => {
                        return Err(BusError::AdminFailed {
                            topic: name,
                            reason: code.to_string(),
                        });
                    }
                }
            }

            tracing::info!(topic = %topic, partitions, replication, "Topic created");
            Ok(())
        })
    }

    fn delete_topic(&self, topic: &str) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            let results = self
                .admin
                .delete_topics(&[&topic], &AdminOptions::new())
                .await
                .map_err(|e| BusError::AdminFailed {
                    topic: topic.clone(),
                    reason: e.to_string(),
                })?;

            for result in results {
                match result {
                    Ok(_) | Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
                    Err((name, code)) => {
                        return Err(BusError::AdminFailed {
                            topic: name,
                            reason: code.to_string(),
                        });
                    }
                }
            }

            tracing::info!(topic = %topic, "Topic deleted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_message_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaMessageBus>();
        assert_sync::<KafkaMessageBus>();
    }

    #[test]
    fn builder_default_works() {
        let _builder = KafkaMessageBus::builder();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = KafkaMessageBus::builder().build();
        assert!(matches!(result, Err(BusError::ConnectionFailed(_))));
    }
}
