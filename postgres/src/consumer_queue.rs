//! Consumer-side staging queue.
//!
//! The consumer ingester inserts every delivered transport message here; the
//! consumer dispatcher and the dynamic reply brokers drain it. Unlike the
//! producer side, rows carry a `processing` marker so a batch can be claimed
//! inside one transaction and released (or deleted) by later, independent
//! transactions once the callback finishes.

use crate::{QueueError, advisory_lock_key};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Global notification channel for newly staged consumer rows.
///
/// Each staged row additionally notifies a channel named after its topic.
pub const CONSUMER_QUEUE_CHANNEL: &str = "consumer_queue";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS consumer_queue (
        id BIGSERIAL PRIMARY KEY,
        topic TEXT NOT NULL,
        partition INT NOT NULL,
        data BYTEA NOT NULL,
        retry INT NOT NULL DEFAULT 0,
        processing BOOL NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
";

const CREATE_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS consumer_queue_lookup_idx
    ON consumer_queue (topic, processing, retry, created_at)
";

/// One staged incoming message.
#[derive(Debug, Clone)]
pub struct ConsumerRow {
    /// Monotonically increasing row id.
    pub id: i64,
    /// Topic the message arrived on.
    pub topic: String,
    /// Transport partition the message arrived from.
    pub partition: i32,
    /// Encoded envelope.
    pub data: Vec<u8>,
    /// Failed dispatch attempts so far.
    pub retry: i32,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// Last modification (claim/release).
    pub updated_at: DateTime<Utc>,
}

impl ConsumerRow {
    fn from_pg_row(row: &PgRow) -> Self {
        Self {
            id: row.get("id"),
            topic: row.get("topic"),
            partition: row.get("partition"),
            data: row.get("data"),
            retry: row.get("retry"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Repository over the `consumer_queue` table.
#[derive(Clone)]
pub struct ConsumerQueue {
    pool: PgPool,
}

impl ConsumerQueue {
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

    /// Create the table and its lookup index if they do not exist.
    ///
    /// Guarded by an advisory lock so concurrent service startups serialize.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the DDL fails.
    pub async fn create_table(&self) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key("consumer_queue"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        sqlx::query(CREATE_INDEX).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stage a delivered transport message and wake the dispatchers.
    ///
    /// Notifies both the global channel and the per-topic channel in the same
    /// transaction as the insert.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the insert fails.
    pub async fn stage(
        &self,
        topic: &str,
        partition: i32,
        data: &[u8],
    ) -> Result<i64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO consumer_queue (topic, partition, data) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(topic)
        .bind(partition)
        .bind(data)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, ''), pg_notify($2, '')")
            .bind(CONSUMER_QUEUE_CHANNEL)
            .bind(topic)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(id, topic, partition, "Staged incoming message");
        metrics::counter!("transit.consumer_queue.staged", "topic" => topic.to_string())
            .increment(1);

        Ok(id)
    }

    /// Count rows dispatchable for the given topic set.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn count_pending(
        &self,
        topics: &[String],
        retry_limit: i32,
    ) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*)
             FROM (SELECT id FROM consumer_queue
                   WHERE NOT processing AND retry < $1 AND topic = ANY($2)
                   FOR UPDATE SKIP LOCKED) s",
        )
        .bind(retry_limit)
        .bind(topics)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Claim a batch of dispatchable rows.
    ///
    /// In one transaction: select under `FOR UPDATE SKIP LOCKED` in
    /// `created_at` order, then set `processing = TRUE` on the selected ids.
    /// If the process dies before the claim commits, the rollback releases
    /// the locks and the rows stay unclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the claim fails.
    pub async fn fetch_batch(
        &self,
        topics: &[String],
        retry_limit: i32,
        records: i64,
    ) -> Result<Vec<ConsumerRow>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, topic, partition, data, retry, created_at, updated_at
             FROM consumer_queue
             WHERE NOT processing AND retry < $1 AND topic = ANY($2)
             ORDER BY created_at
             LIMIT $3
             FOR UPDATE SKIP LOCKED",
        )
        .bind(retry_limit)
        .bind(topics)
        .bind(records)
        .fetch_all(&mut *tx)
        .await?;

        let entries: Vec<ConsumerRow> = rows.iter().map(ConsumerRow::from_pg_row).collect();

        if !entries.is_empty() {
            let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
            sqlx::query("UPDATE consumer_queue SET processing = TRUE WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(entries)
    }

    /// Delete a row after its callback succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    pub async fn mark_processed(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM consumer_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a row after its callback failed: clear the claim and bump the
    /// retry counter.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    pub async fn mark_failure(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE consumer_queue
             SET processing = FALSE, retry = retry + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        metrics::counter!("transit.consumer_queue.retries").increment(1);
        Ok(())
    }

    /// Fetch a single row by id, regardless of state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::RowNotFound`] if the id does not exist.
    pub async fn get(&self, id: i64) -> Result<ConsumerRow, QueueError> {
        let row = sqlx::query(
            "SELECT id, topic, partition, data, retry, created_at, updated_at
             FROM consumer_queue WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(ConsumerRow::from_pg_row)
            .ok_or(QueueError::RowNotFound(id))
    }

    /// Count rows waiting on a single topic, ignoring the retry bound.
    ///
    /// Used by the dynamic reply brokers, which consume every reply staged on
    /// their private topic.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn count_for_topic(&self, topic: &str) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*)
             FROM (SELECT id FROM consumer_queue WHERE topic = $1 FOR UPDATE SKIP LOCKED) s",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Atomically take up to `limit` rows from a single topic.
    ///
    /// In one transaction: select in `created_at` order under `FOR UPDATE
    /// SKIP LOCKED`, delete each selected row, commit. The returned rows are
    /// the consumed replies.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the take fails.
    pub async fn take_for_topic(
        &self,
        topic: &str,
        limit: i64,
    ) -> Result<Vec<ConsumerRow>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, topic, partition, data, retry, created_at, updated_at
             FROM consumer_queue
             WHERE topic = $1
             ORDER BY created_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let entries: Vec<ConsumerRow> = rows.iter().map(ConsumerRow::from_pg_row).collect();

        for entry in &entries {
            sqlx::query("DELETE FROM consumer_queue WHERE id = $1")
                .bind(entry.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(entries)
    }
}
