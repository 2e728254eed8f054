//! Producer dispatcher: drains `producer_queue` to the external transport.
//!
//! The loop sleeps on `LISTEN producer_queue` and wakes when a publisher
//! stages a row (or when the `max_wait` tick fires as a safety net). Each
//! drain cycle selects a batch of rows under `FOR UPDATE SKIP LOCKED` in one
//! transaction, publishes them, and resolves each row inside that same
//! transaction: delete on publish success, bump `retry` on failure. Multiple
//! dispatcher workers — in this process or others — drain in parallel
//! without ever picking the same row.
//!
//! Rows that keep failing stay in the table once they reach the retry limit;
//! they are no longer selected, and their age is the operator's signal.

use crate::retry::BackoffPolicy;
use crate::service::{BackgroundService, ServiceError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use transit_core::bus::{BusError, MessageBus};
use transit_core::message::MessageStrategy;
use transit_postgres::{PRODUCER_QUEUE_CHANNEL, ProducerQueue, QueueError, QueueListener};

/// Errors raised by the producer dispatcher.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// A staging-queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Tuning parameters for one producer dispatcher.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Per-batch row limit.
    pub records: i64,
    /// Rows at or above this retry count are no longer selected.
    pub retry_limit: i32,
    /// Upper bound on one wait-for-notification tick.
    pub max_wait: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            records: 10,
            retry_limit: 5,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// The producer dispatcher.
pub struct Producer {
    queue: ProducerQueue,
    bus: Arc<dyn MessageBus>,
    config: ProducerConfig,
}

impl Producer {
    /// Create a dispatcher draining `queue` into `bus`.
    #[must_use]
    pub fn new(queue: ProducerQueue, bus: Arc<dyn MessageBus>, config: ProducerConfig) -> Self {
        Self { queue, bus, config }
    }

    /// Publish one payload directly to the transport, bypassing the queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the transport rejects the publish.
    pub async fn publish(
        &self,
        topic: &str,
        strategy: MessageStrategy,
        payload: &[u8],
    ) -> Result<(), BusError> {
        // Unicast messages are keyed by topic so a single partition observes
        // them in staging order; multicast messages fan out unkeyed.
        let key = match strategy {
            MessageStrategy::Unicast => Some(topic.as_bytes()),
            MessageStrategy::Multicast => None,
        };
        self.bus.publish(topic, key, payload).await
    }

    /// Run one drain cycle; returns the number of rows published and deleted.
    ///
    /// Row locks are held only for the duration of the batch's publishes, so
    /// a slow transport naturally caps throughput instead of piling up locks.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Queue`] if a database operation fails.
    /// Transport failures are not errors at this level: they are accounted
    /// per-row via the retry counter.
    pub async fn dispatch(&self) -> Result<usize, ProducerError> {
        let mut tx = self.queue.begin().await?;
        let rows =
            ProducerQueue::select_batch(&mut tx, self.config.retry_limit, self.config.records)
                .await?;

        if rows.is_empty() {
            tx.rollback().await.map_err(QueueError::from)?;
            return Ok(0);
        }

        tracing::debug!(batch = rows.len(), "Draining producer queue");

        let mut published = 0;
        for row in &rows {
            match self.publish(&row.topic, row.strategy, &row.data).await {
                Ok(()) => {
                    ProducerQueue::delete(&mut tx, row.id).await?;
                    published += 1;
                    metrics::counter!("transit.producer.published", "topic" => row.topic.clone())
                        .increment(1);
                }
                Err(e) => {
                    tracing::warn!(
                        id = row.id,
                        topic = %row.topic,
                        retry = row.retry,
                        error = %e,
                        "Publish failed, keeping row for retry"
                    );
                    ProducerQueue::mark_retry(&mut tx, row.id).await?;
                }
            }
        }

        tx.commit().await.map_err(QueueError::from)?;
        Ok(published)
    }

    /// Run the dispatch loop until `shutdown` flips to `true`.
    ///
    /// The loop arms `LISTEN producer_queue`, then alternates between
    /// draining while rows are pending and sleeping on the notification
    /// channel. Database outages are survived by reconnecting with backoff;
    /// the loop itself only ends on shutdown.
    ///
    /// # Errors
    ///
    /// Reserved for unrecoverable failures; connection losses are retried
    /// internally.
    pub async fn dispatch_forever(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProducerError> {
        let backoff = BackoffPolicy::default();
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                tracing::info!("Producer dispatcher stopping");
                return Ok(());
            }

            match self.run_connected(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "Producer loop lost its connection, reconnecting");
                    backoff.wait(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Fallible part of the loop: listen, then drain-or-wait until shutdown
    /// or a database error surfaces.
    async fn run_connected(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ProducerError> {
        let mut listener = QueueListener::connect(self.queue.pool()).await?;
        listener.listen(PRODUCER_QUEUE_CHANNEL).await?;
        tracing::debug!(channel = PRODUCER_QUEUE_CHANNEL, "Producer dispatcher listening");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if self.queue.count_pending(self.config.retry_limit).await? > 0 {
                self.dispatch().await?;
                continue;
            }

            tokio::select! {
                result = listener.wait(self.config.max_wait) => {
                    // Whether notified or timed out, loop back to re-check the count.
                    result?;
                }
                _ = shutdown.changed() => {}
            }
        }
    }
}

impl BackgroundService for Producer {
    fn name(&self) -> &str {
        "producer-dispatcher"
    }

    fn setup(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async {
            self.queue
                .create_table()
                .await
                .map_err(|e| ServiceError::DatabaseUnavailable(e.to_string()))
        })
    }

    fn run(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            self.dispatch_forever(shutdown)
                .await
                .map_err(|e| ServiceError::Runtime(e.to_string()))
        })
    }
}
