//! # Transit Runtime
//!
//! The moving parts of the Transit broker: everything between a user
//! calling `send()` and a remote callback observing the message.
//!
//! ## Components
//!
//! - **[`publisher`]** — typed `send()` APIs ([`EventBroker`],
//!   [`CommandBroker`], [`CommandReplyBroker`]) staging envelopes into
//!   `producer_queue`.
//! - **[`producer`]** — the [`Producer`] dispatcher draining the staging
//!   queue to the external transport with per-row retry accounting.
//! - **[`ingester`]** — the [`Ingester`] staging transport deliveries into
//!   `consumer_queue`.
//! - **[`dispatcher`]** — the [`ConsumerDispatcher`] invoking registered
//!   callbacks with per-kind semantics, bounded concurrency and
//!   dead-lettering.
//! - **[`dynamic`]** — the [`DynamicBrokerPool`] leasing private reply
//!   topics for request/response flows.
//! - **[`service`]** — lifecycle wrappers and exit-code mapping for host
//!   processes.
//! - **[`retry`]** — the reconnect backoff shared by the loops.
//!
//! ## Wiring
//!
//! There are no process-wide singletons: the entry point builds the shared
//! pieces once and hands them to each component.
//!
//! ```ignore
//! let pool = PgPool::connect(&config.broker.queue.url()).await?;
//! let bus: Arc<dyn MessageBus> = Arc::new(KafkaMessageBus::new(&config.broker.bootstrap_servers())?);
//!
//! let producer_queue = ProducerQueue::new(pool.clone());
//! let consumer_queue = ConsumerQueue::new(pool.clone());
//! let dead_letter = DeadLetterQueue::new(pool.clone());
//!
//! let publisher = Arc::new(BrokerPublisher::new(producer_queue.clone(), &config.service.name));
//! let registry = EnrouteRegistry::build(&services)?;
//!
//! let producer = Producer::new(producer_queue, bus.clone(), ProducerConfig::default());
//! let ingester = Arc::new(Ingester::new(
//!     consumer_queue.clone(),
//!     bus.clone(),
//!     &config.service.name,
//!     registry.topics().into_iter().collect(),
//! ));
//! let commands = ConsumerDispatcher::for_commands(
//!     consumer_queue.clone(),
//!     dead_letter.clone(),
//!     &registry,
//!     Arc::new(CommandReplyBroker::new(publisher.clone())),
//!     DispatcherConfig::default(),
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;
pub mod dynamic;
pub mod ingester;
pub mod producer;
pub mod publisher;
pub mod retry;
pub mod service;

pub use dispatcher::{ConsumerDispatcher, DispatchError, DispatchKind, DispatcherConfig};
pub use dynamic::{DynamicBroker, DynamicBrokerLease, DynamicBrokerPool, DynamicError, ReplyEntry};
pub use ingester::{IngestError, Ingester};
pub use producer::{Producer, ProducerConfig, ProducerError};
pub use publisher::{
    BrokerPublisher, CommandBroker, CommandReplyBroker, EventBroker, PublishError,
};
pub use service::{BackgroundService, PeriodicRunner, ServiceError, ServiceRunner, exit_code};
