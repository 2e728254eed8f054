//! `PostgreSQL` staging-queue repositories for the Transit broker.
//!
//! Two short-lived tables carry every message through the system:
//!
//! - [`producer_queue`](ProducerQueue) — outgoing envelopes staged by
//!   `send()` and drained to the external transport by the producer
//!   dispatcher.
//! - [`consumer_queue`](ConsumerQueue) — incoming envelopes staged by the
//!   consumer ingester and drained to user callbacks by the consumer
//!   dispatcher.
//!
//! Rows whose processing keeps failing are moved to the
//! [`broker_dead_letter`](DeadLetterQueue) table once they reach the retry
//! limit.
//!
//! Coordination across processes uses only two database primitives: row-level
//! locks (`FOR UPDATE SKIP LOCKED`) for work distribution, and
//! `LISTEN`/`NOTIFY` ([`QueueListener`]) to wake sleeping dispatchers. Table
//! creation takes an advisory lock keyed by the table-name hash so concurrent
//! service startups do not race.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer_queue;
mod dead_letter;
mod listener;
mod producer_queue;

pub use consumer_queue::{CONSUMER_QUEUE_CHANNEL, ConsumerQueue, ConsumerRow};
pub use dead_letter::{DeadLetterQueue, DeadLetterRow, DeadLetterStatus};
pub use listener::QueueListener;
pub use producer_queue::{PRODUCER_QUEUE_CHANNEL, ProducerQueue, ProducerRow};

use std::hash::{DefaultHasher, Hash, Hasher};
use thiserror::Error;

/// Errors raised by the staging-queue repositories.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A query failed or the connection was lost mid-statement.
    #[error("database error: {0}")]
    Database(String),

    /// A row referenced by id does not exist.
    #[error("row {0} not found")]
    RowNotFound(i64),
}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

/// Advisory-lock key for guarded DDL: a stable hash of the table name.
pub(crate) fn advisory_lock_key(table: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    #[allow(clippy::cast_possible_wrap)] // The lock key is an opaque 64-bit value.
    {
        hasher.finish() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_key_is_stable() {
        assert_eq!(
            advisory_lock_key("producer_queue"),
            advisory_lock_key("producer_queue")
        );
        assert_ne!(
            advisory_lock_key("producer_queue"),
            advisory_lock_key("consumer_queue")
        );
    }
}
