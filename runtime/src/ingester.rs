//! Consumer ingester: transport deliveries into `consumer_queue`.
//!
//! Subscribes to the external transport for the union of all registered
//! topics (plus any dynamically leased reply topics) and stages every
//! delivered message into the consumer queue, where the dispatchers pick it
//! up. The ingester never invokes user code.
//!
//! Staging failures are retried with backoff instead of dropping the
//! delivery: the transport's at-least-once redelivery is the backstop for
//! process death, not for transient database errors.

use crate::retry::BackoffPolicy;
use crate::service::{BackgroundService, ServiceError};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use transit_core::bus::{BusError, IngestStream, MessageBus, SubscriptionControl};
use transit_postgres::ConsumerQueue;

/// Errors raised by the consumer ingester.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The transport subscription failed or was lost.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The ingester was asked to change topics before `setup()` ran.
    #[error("ingester subscription is not active")]
    NotSubscribed,
}

/// The consumer ingester.
pub struct Ingester {
    queue: ConsumerQueue,
    bus: Arc<dyn MessageBus>,
    group_id: String,
    topics: Vec<String>,
    stream: Mutex<Option<IngestStream>>,
    control: Mutex<Option<Box<dyn SubscriptionControl>>>,
}

impl Ingester {
    /// Create an ingester staging deliveries for the given topic set.
    ///
    /// `group_id` is the service name: every instance of the same service
    /// shares one subscriber group and splits the partitions between them.
    pub fn new(
        queue: ConsumerQueue,
        bus: Arc<dyn MessageBus>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            queue,
            bus,
            group_id: group_id.into(),
            topics,
            stream: Mutex::new(None),
            control: Mutex::new(None),
        }
    }

    /// Open the transport subscription.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Bus`] if the subscription cannot be created.
    pub async fn setup(&self) -> Result<(), IngestError> {
        let (stream, control) = self.bus.subscribe(&self.topics, &self.group_id).await?;
        *self.stream.lock().await = Some(stream);
        *self.control.lock().await = Some(control);
        tracing::info!(
            group_id = %self.group_id,
            topics = ?self.topics,
            "Consumer ingester subscribed"
        );
        Ok(())
    }

    /// Subscribe an additional topic on the live subscription.
    ///
    /// Used by the dynamic reply pool when it leases a reply topic.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotSubscribed`] before `setup()`, or
    /// [`IngestError::Bus`] if the re-subscribe fails.
    pub async fn add_topic(&self, topic: &str) -> Result<(), IngestError> {
        let control = self.control.lock().await;
        let control = control.as_ref().ok_or(IngestError::NotSubscribed)?;
        control.add_topic(topic).await?;
        Ok(())
    }

    /// Remove a topic from the live subscription.
    ///
    /// Rows already staged from the topic are still drained from the
    /// consumer queue; only future deliveries stop.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::NotSubscribed`] before `setup()`, or
    /// [`IngestError::Bus`] if the re-subscribe fails.
    pub async fn remove_topic(&self, topic: &str) -> Result<(), IngestError> {
        let control = self.control.lock().await;
        let control = control.as_ref().ok_or(IngestError::NotSubscribed)?;
        control.remove_topic(topic).await?;
        Ok(())
    }

    /// Consume the subscription until `shutdown` flips to `true`.
    ///
    /// Calls [`Ingester::setup`] first if it has not run yet.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Bus`] if the subscription cannot be
    /// established or ends unexpectedly.
    pub async fn dispatch_forever(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        if self.stream.lock().await.is_none() {
            self.setup().await?;
        }

        let mut stream = self
            .stream
            .lock()
            .await
            .take()
            .ok_or(IngestError::NotSubscribed)?;

        let backoff = BackoffPolicy::default();

        loop {
            tokio::select! {
                delivery = stream.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.stage_with_retry(&backoff, &delivery.topic, delivery.partition, &delivery.payload, &mut shutdown).await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Transport error on ingest stream");
                        }
                        None => {
                            tracing::info!("Ingest stream ended");
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Consumer ingester stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stage one delivery, retrying database errors until success or
    /// shutdown.
    async fn stage_with_retry(
        &self,
        backoff: &BackoffPolicy,
        topic: &str,
        partition: i32,
        payload: &[u8],
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut attempt = 0;
        loop {
            match self.queue.stage(topic, partition, payload).await {
                Ok(_id) => return,
                Err(e) => {
                    if *shutdown.borrow() {
                        tracing::warn!(
                            topic,
                            error = %e,
                            "Dropping delivery during shutdown; transport will redeliver"
                        );
                        return;
                    }
                    tracing::warn!(topic, attempt, error = %e, "Staging failed, backing off");
                    backoff.wait(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

impl BackgroundService for Ingester {
    fn name(&self) -> &str {
        "consumer-ingester"
    }

    fn setup(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async {
            self.setup()
                .await
                .map_err(|e| ServiceError::BrokerUnavailable(e.to_string()))
        })
    }

    fn run(&self, shutdown: watch::Receiver<bool>) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            self.dispatch_forever(shutdown)
                .await
                .map_err(|e| ServiceError::Runtime(e.to_string()))
        })
    }
}
