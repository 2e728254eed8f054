//! Producer-side staging queue.
//!
//! Outgoing envelopes are inserted here by the publishers and drained to the
//! external transport by the producer dispatcher. There is no `processing`
//! column: producer-side isolation relies entirely on `FOR UPDATE SKIP
//! LOCKED`, so a row is either visible to a drain transaction or locked by
//! one.

use crate::{QueueError, advisory_lock_key};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use transit_core::message::MessageStrategy;

/// Notification channel for newly staged producer rows.
pub const PRODUCER_QUEUE_CHANNEL: &str = "producer_queue";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS producer_queue (
        id BIGSERIAL PRIMARY KEY,
        topic TEXT NOT NULL,
        data BYTEA NOT NULL,
        strategy TEXT NOT NULL DEFAULT 'unicast',
        retry INT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
";

/// One staged outgoing message.
#[derive(Debug, Clone)]
pub struct ProducerRow {
    /// Monotonically increasing row id.
    pub id: i64,
    /// Destination topic.
    pub topic: String,
    /// Encoded envelope.
    pub data: Vec<u8>,
    /// Delivery strategy recorded at staging time.
    pub strategy: MessageStrategy,
    /// Failed publish attempts so far.
    pub retry: i32,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// Last modification (retry bumps).
    pub updated_at: DateTime<Utc>,
}

impl ProducerRow {
    fn from_pg_row(row: &PgRow) -> Result<Self, QueueError> {
        let strategy: String = row.get("strategy");
        let strategy = MessageStrategy::parse(&strategy)
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(Self {
            id: row.get("id"),
            topic: row.get("topic"),
            data: row.get("data"),
            strategy,
            retry: row.get("retry"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

/// Repository over the `producer_queue` table.
#[derive(Clone)]
pub struct ProducerQueue {
    pool: PgPool,
}

impl ProducerQueue {
    /// Create a repository over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table if it does not exist.
    ///
    /// Guarded by an advisory lock so concurrent service startups serialize.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the DDL fails.
    pub async fn create_table(&self) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key("producer_queue"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stage an outgoing message and wake the producer dispatcher.
    ///
    /// Runs `INSERT … RETURNING id` and the notify in a single transaction,
    /// so a dispatcher woken by the notification always sees the row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    pub async fn enqueue(
        &self,
        topic: &str,
        data: &[u8],
        strategy: MessageStrategy,
    ) -> Result<i64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO producer_queue (topic, data, strategy) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(topic)
        .bind(data)
        .bind(strategy.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, '')")
            .bind(PRODUCER_QUEUE_CHANNEL)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(id, topic, strategy = strategy.as_str(), "Staged outgoing message");
        metrics::counter!("transit.producer_queue.staged", "topic" => topic.to_string())
            .increment(1);

        Ok(id)
    }

    /// Count rows still eligible for dispatch.
    ///
    /// Rows at or above the retry limit are invisible here: they stay in the
    /// table for operators but are never selected again.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn count_pending(&self, retry_limit: i32) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM (SELECT id FROM producer_queue WHERE retry < $1 FOR UPDATE SKIP LOCKED) s",
        )
        .bind(retry_limit)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Begin a drain transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if no connection is available.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueError> {
        Ok(self.pool.begin().await?)
    }

    /// Select a batch of dispatchable rows under row-level locks.
    ///
    /// The locks are held for the lifetime of `tx`; concurrent drain
    /// transactions skip locked rows, so N workers never pick the same row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn select_batch(
        tx: &mut Transaction<'_, Postgres>,
        retry_limit: i32,
        records: i64,
    ) -> Result<Vec<ProducerRow>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, topic, data, strategy, retry, created_at, updated_at
             FROM producer_queue
             WHERE retry < $1
             ORDER BY created_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(retry_limit)
        .bind(records)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(ProducerRow::from_pg_row).collect()
    }

    /// Delete a row after a successful publish.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    pub async fn delete(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM producer_queue WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Bump the retry counter after a failed publish.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    pub async fn mark_retry(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE producer_queue SET retry = retry + 1, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        metrics::counter!("transit.producer_queue.retries").increment(1);
        Ok(())
    }
}
