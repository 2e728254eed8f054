//! # Transit Core
//!
//! Core types and abstractions for the Transit broker: the durable,
//! transactionally-staged asynchronous message bus that couples services
//! through relational staging queues and an external publish/subscribe
//! transport.
//!
//! This crate is the leaf of the workspace. It defines:
//!
//! - **[`message`]** — the unified [`BrokerMessage`](message::BrokerMessage)
//!   envelope, its status/strategy enums, the causal
//!   [`Trace`](message::Trace) chain, and the binary codec.
//! - **[`request`]** — the [`Request`](request::Request)/
//!   [`Response`](request::Response) model handed to user callbacks, with
//!   the explicit request [`Context`](request::Context).
//! - **[`enroute`]** — the declarative routing registry binding broker
//!   topics, REST routes and schedules to normalized callbacks.
//! - **[`bus`]** — the [`MessageBus`](bus::MessageBus) seam to the external
//!   transport.
//! - **[`config`]** — the recognized configuration options.
//! - **[`discovery`]** — the discovery-service connector interface.
//!
//! # Architecture
//!
//! ```text
//! user handler
//!      │ send()
//!      ▼
//! ┌──────────────────┐   NOTIFY    ┌──────────────────┐
//! │  producer_queue  │ ──────────► │ producer         │
//! │  (Postgres)      │             │ dispatcher       │
//! └──────────────────┘             └────────┬─────────┘
//!                                           │ publish
//!                                           ▼
//!                                  ┌──────────────────┐
//!                                  │  external bus    │
//!                                  │  (Kafka)         │
//!                                  └────────┬─────────┘
//!                                           │ deliver
//!                                           ▼
//! ┌──────────────────┐   NOTIFY    ┌──────────────────┐
//! │  consumer_queue  │ ◄────────── │ consumer         │
//! │  (Postgres)      │ ──────────► │ ingester /       │
//! └──────────────────┘             │ dispatcher       │
//!                                  └────────┬─────────┘
//!                                           │ callback
//!                                           ▼
//!                                    user handler
//! ```
//!
//! Everything above the envelope depends on it; the envelope depends on
//! nothing in the workspace.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod discovery;
pub mod enroute;
pub mod message;
pub mod request;

pub use bus::{BusError, Delivery, IngestStream, MessageBus, SubscriptionControl};
pub use config::{BrokerConfig, PoolConfig, QueueConfig, ServiceConfig, TransitConfig};
pub use enroute::{Callback, EnrouteKind, EnrouteRegistry, EnrouteService, RouteDef, RouteTarget};
pub use message::{
    BrokerMessage, CodecError, EventData, MessageStatus, MessageStrategy, Trace, TraceStep,
};
pub use request::{Context, HandlerError, Request, Response};
