//! Dynamic reply brokers: request/response over a one-way bus.
//!
//! An operation that needs replies leases a [`DynamicBroker`] from the
//! [`DynamicBrokerPool`]. Each lease owns a private reply topic (a random
//! UUID hex name) created on the external transport and added to the
//! consumer ingester's subscription, so concurrent request flows can never
//! observe each other's replies.
//!
//! Released leases return to the pool's free list and are reused
//! most-recently-released first; a lease idle for longer than `recycle`
//! seconds is torn down (topic deleted, subscription removed) instead of
//! being handed out again. [`DynamicBrokerPool::close`] tears down every
//! idle lease eagerly.

use crate::ingester::{IngestError, Ingester};
use crate::publisher::{BrokerPublisher, PublishError};
use chrono::{DateTime, Utc};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use transit_core::bus::{BusError, MessageBus};
use transit_core::config::PoolConfig;
use transit_core::message::{BrokerMessage, CodecError};
use transit_core::request::Context;
use transit_postgres::{ConsumerQueue, QueueError, QueueListener};
use uuid::Uuid;

/// Default bound on one inner wait-for-notification tick.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Errors raised by the dynamic brokers and their pool.
#[derive(Error, Debug)]
pub enum DynamicError {
    /// The total timeout elapsed before enough replies arrived.
    #[error("timeout while fetching {expected} entries from '{topic}' ({collected} collected)")]
    NotEnoughEntries {
        /// The reply topic being drained.
        topic: String,
        /// How many entries were requested.
        expected: usize,
        /// How many arrived before the timeout.
        collected: usize,
    },

    /// A staging-queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A reply row did not decode into an envelope.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The request could not be staged.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// A transport admin operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The ingester rejected a subscription change.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The pool was closed.
    #[error("dynamic broker pool is closed")]
    PoolClosed,
}

/// One reply consumed from a dynamic topic.
#[derive(Debug, Clone)]
pub struct ReplyEntry {
    /// Consumer-queue row id the reply was staged under.
    pub id: i64,
    /// The decoded reply envelope.
    pub message: BrokerMessage,
    /// When the reply was staged; entries are returned in this order.
    pub created_at: DateTime<Utc>,
}

/// A broker bound to one private reply topic.
pub struct DynamicBroker {
    topic: String,
    publisher: Arc<BrokerPublisher>,
    queue: ConsumerQueue,
}

impl DynamicBroker {
    fn new(topic: String, publisher: Arc<BrokerPublisher>, queue: ConsumerQueue) -> Self {
        Self {
            topic,
            publisher,
            queue,
        }
    }

    /// The private reply topic of this broker.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send a command whose replies route to this broker's topic.
    ///
    /// Any reply topic in the context is overridden by `self.topic()`.
    /// Returns the envelope identifier for correlation.
    ///
    /// # Errors
    ///
    /// Returns [`DynamicError::Publish`] if encoding or staging fails.
    pub async fn send(
        &self,
        data: Vec<u8>,
        topic: &str,
        user: Option<Uuid>,
        ctx: &Context,
    ) -> Result<Uuid, DynamicError> {
        let mut message = BrokerMessage::new(topic, data, self.publisher.trace_for(ctx))
            .with_reply_topic(self.topic.clone());
        message.user = user.or(ctx.user);

        let identifier = message.identifier();
        self.publisher.stage(&message).await?;
        Ok(identifier)
    }

    /// Wait for exactly one reply.
    ///
    /// # Errors
    ///
    /// Returns [`DynamicError::NotEnoughEntries`] if no reply arrives within
    /// `timeout`.
    pub async fn get_one(&self, timeout: Duration) -> Result<ReplyEntry, DynamicError> {
        let mut entries = self.get_many(1, timeout, DEFAULT_MAX_WAIT).await?;
        // get_many returns exactly the requested count on success.
        entries
            .pop()
            .ok_or_else(|| DynamicError::NotEnoughEntries {
                topic: self.topic.clone(),
                expected: 1,
                collected: 0,
            })
    }

    /// Wait for exactly `count` replies, in `created_at` order.
    ///
    /// Listens on the topic's notification channel and consumes staged rows
    /// as they appear. `max_wait` bounds a single wait-for-notification
    /// tick; `timeout` bounds the whole call.
    ///
    /// # Errors
    ///
    /// Returns [`DynamicError::NotEnoughEntries`] if fewer than `count`
    /// replies arrive within `timeout`. Consumed entries are not restored:
    /// each returned row was already deleted from the queue.
    pub async fn get_many(
        &self,
        count: usize,
        timeout: Duration,
        max_wait: Duration,
    ) -> Result<Vec<ReplyEntry>, DynamicError> {
        let deadline = Instant::now() + timeout;
        let mut listener = QueueListener::connect(self.queue.pool()).await?;
        listener.listen(&self.topic).await?;

        let mut entries: Vec<ReplyEntry> = Vec::with_capacity(count);
        while entries.len() < count {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    topic = %self.topic,
                    expected = count,
                    collected = entries.len(),
                    "Timed out waiting for replies"
                );
                return Err(DynamicError::NotEnoughEntries {
                    topic: self.topic.clone(),
                    expected: count,
                    collected: entries.len(),
                });
            }

            if self.queue.count_for_topic(&self.topic).await? == 0 {
                let tick = max_wait.min(deadline - now);
                listener.wait(tick).await?;
                continue;
            }

            #[allow(clippy::cast_possible_wrap)] // count is a small request size
            let missing = (count - entries.len()) as i64;
            let rows = self.queue.take_for_topic(&self.topic, missing).await?;
            for row in rows {
                let message = BrokerMessage::decode(&row.data)?;
                entries.push(ReplyEntry {
                    id: row.id,
                    message,
                    created_at: row.created_at,
                });
            }
        }

        tracing::debug!(topic = %self.topic, count = entries.len(), "Collected replies");
        Ok(entries)
    }
}

struct IdleBroker {
    broker: DynamicBroker,
    released_at: Instant,
}

struct PoolShared {
    bus: Arc<dyn MessageBus>,
    ingester: Arc<Ingester>,
    publisher: Arc<BrokerPublisher>,
    queue: ConsumerQueue,
    recycle: Duration,
    idle: Mutex<Vec<IdleBroker>>,
    semaphore: Arc<Semaphore>,
}

/// Pool of [`DynamicBroker`] leases.
pub struct DynamicBrokerPool {
    shared: Arc<PoolShared>,
}

impl DynamicBrokerPool {
    /// Create a pool bounded by `config.maxsize` live leases, recycling idle
    /// leases after `config.recycle` seconds.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        ingester: Arc<Ingester>,
        publisher: Arc<BrokerPublisher>,
        queue: ConsumerQueue,
        config: &PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                bus,
                ingester,
                publisher,
                queue,
                recycle: Duration::from_secs(config.recycle),
                idle: Mutex::new(Vec::new()),
                semaphore: Arc::new(Semaphore::new(config.maxsize)),
            }),
        }
    }

    /// Check out a broker, creating one if no fresh idle lease exists.
    ///
    /// Blocks while `maxsize` leases are already checked out. Bind the
    /// returned lease's [`DynamicBrokerLease::context`] into downstream
    /// `send()` calls so replies route to the leased topic.
    ///
    /// # Errors
    ///
    /// Returns [`DynamicError::PoolClosed`] after [`DynamicBrokerPool::close`],
    /// or the underlying error if a new lease cannot be created.
    pub async fn acquire(&self) -> Result<DynamicBrokerLease, DynamicError> {
        let permit = Arc::clone(&self.shared.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DynamicError::PoolClosed)?;

        loop {
            let candidate = {
                let Ok(mut idle) = self.shared.idle.lock() else {
                    return Err(DynamicError::PoolClosed);
                };
                idle.pop()
            };

            match candidate {
                None => break,
                Some(idle) if idle.released_at.elapsed() < self.shared.recycle => {
                    return Ok(DynamicBrokerLease {
                        broker: Some(idle.broker),
                        shared: Arc::clone(&self.shared),
                        _permit: permit,
                    });
                }
                Some(stale) => {
                    destroy_instance(&self.shared, stale.broker).await;
                }
            }
        }

        let broker = self.create_instance().await?;
        Ok(DynamicBrokerLease {
            broker: Some(broker),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Tear down every idle lease and reject further acquires.
    ///
    /// Leases still checked out stay usable; they are torn down lazily when
    /// released into the closed pool's next acquire (which never comes) —
    /// their topics are reclaimed by transport retention policy.
    pub async fn close(&self) {
        self.shared.semaphore.close();
        loop {
            let candidate = {
                let Ok(mut idle) = self.shared.idle.lock() else {
                    return;
                };
                idle.pop()
            };
            match candidate {
                Some(entry) => destroy_instance(&self.shared, entry.broker).await,
                None => return,
            }
        }
    }

    /// Create a fresh lease: random topic, transport topic creation,
    /// ingester subscription, broker instance.
    async fn create_instance(&self) -> Result<DynamicBroker, DynamicError> {
        let topic = Uuid::new_v4().simple().to_string();
        tracing::info!(topic = %topic, "Creating reply topic");

        self.shared.bus.create_topic(&topic, 1, 1).await?;
        self.shared.ingester.add_topic(&topic).await?;

        Ok(DynamicBroker::new(
            topic,
            Arc::clone(&self.shared.publisher),
            self.shared.queue.clone(),
        ))
    }
}

/// Tear down a lease in reverse creation order. Failures are logged, not
/// propagated: a leaked topic is an operator cleanup, not a caller error.
async fn destroy_instance(shared: &PoolShared, broker: DynamicBroker) {
    let topic = broker.topic().to_string();
    tracing::info!(topic = %topic, "Deleting reply topic");

    if let Err(e) = shared.ingester.remove_topic(&topic).await {
        tracing::warn!(topic = %topic, error = %e, "Failed to unsubscribe reply topic");
    }
    if let Err(e) = shared.bus.delete_topic(&topic).await {
        tracing::warn!(topic = %topic, error = %e, "Failed to delete reply topic");
    }
}

/// A checked-out [`DynamicBroker`]; returns to the pool on drop.
pub struct DynamicBrokerLease {
    broker: Option<DynamicBroker>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl DynamicBrokerLease {
    /// A request context with the reply topic bound to the leased topic.
    ///
    /// Thread this into `send()` calls made within the lease scope so their
    /// replies route back here.
    #[must_use]
    pub fn context(&self) -> Context {
        Context::default().with_reply_topic(self.topic())
    }
}

impl Deref for DynamicBrokerLease {
    type Target = DynamicBroker;

    fn deref(&self) -> &Self::Target {
        // The option is only emptied in drop.
        self.broker
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease accessed after drop"))
    }
}

impl Drop for DynamicBrokerLease {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.take() {
            if let Ok(mut idle) = self.shared.idle.lock() {
                idle.push(IdleBroker {
                    broker,
                    released_at: Instant::now(),
                });
            }
        }
    }
}
