//! Dead-letter queue for consumer rows that exhausted their retries.
//!
//! The consumer dispatcher moves a failing row here once its retry counter
//! reaches the limit, instead of leaving it to clutter `consumer_queue`
//! forever. Entries keep the encoded envelope plus failure metadata, enabling
//! incident investigation and manual requeueing.

use crate::consumer_queue::ConsumerRow;
use crate::{QueueError, advisory_lock_key};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS broker_dead_letter (
        id BIGSERIAL PRIMARY KEY,
        topic TEXT NOT NULL,
        partition INT NOT NULL,
        data BYTEA NOT NULL,
        error_message TEXT NOT NULL,
        retry_count INT NOT NULL,
        first_failed_at TIMESTAMPTZ NOT NULL,
        last_failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        status TEXT NOT NULL DEFAULT 'pending',
        resolved_at TIMESTAMPTZ,
        resolution_notes TEXT
    )
";

/// Status of a dead-lettered row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Awaiting investigation or requeueing.
    Pending,
    /// Successfully requeued or otherwise fixed.
    Resolved,
    /// Permanently discarded (cannot be fixed).
    Discarded,
}

impl DeadLetterStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the string names no status.
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            other => Err(QueueError::Database(format!(
                "invalid dead-letter status: {other}"
            ))),
        }
    }
}

/// One dead-lettered row with its failure metadata.
#[derive(Debug, Clone)]
pub struct DeadLetterRow {
    /// Dead-letter entry id.
    pub id: i64,
    /// Topic the original row arrived on.
    pub topic: String,
    /// Transport partition of the original row.
    pub partition: i32,
    /// Encoded envelope of the original row.
    pub data: Vec<u8>,
    /// Error message from the last failed dispatch.
    pub error_message: String,
    /// Retry count at the time of burial.
    pub retry_count: i32,
    /// When the original row was first staged.
    pub first_failed_at: DateTime<Utc>,
    /// When the row was buried.
    pub last_failed_at: DateTime<Utc>,
    /// Current status.
    pub status: DeadLetterStatus,
    /// When the entry was resolved or discarded, if it was.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes on the resolution.
    pub resolution_notes: Option<String>,
}

/// Repository over the `broker_dead_letter` table.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a repository over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the DDL fails.
    pub async fn create_table(&self) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key("broker_dead_letter"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move a consumer row into the dead-letter table.
    ///
    /// Inserts the dead-letter entry and deletes the source row in one
    /// transaction, so the row is in exactly one of the two tables at any
    /// point.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the move fails.
    pub async fn bury(&self, row: &ConsumerRow, error_message: &str) -> Result<i64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO broker_dead_letter
                 (topic, partition, data, error_message, retry_count, first_failed_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&row.topic)
        .bind(row.partition)
        .bind(&row.data)
        .bind(error_message)
        .bind(row.retry)
        .bind(row.created_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM consumer_queue WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::warn!(
            dead_letter_id = id,
            source_id = row.id,
            topic = %row.topic,
            retry_count = row.retry,
            error = error_message,
            "Consumer row moved to dead-letter queue"
        );
        metrics::counter!("transit.dead_letter.buried", "topic" => row.topic.clone())
            .increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<DeadLetterRow>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, topic, partition, data, error_message, retry_count,
                    first_failed_at, last_failed_at, status, resolved_at, resolution_notes
             FROM broker_dead_letter
             WHERE status = 'pending'
             ORDER BY first_failed_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(DeadLetterRow {
                    id: row.get("id"),
                    topic: row.get("topic"),
                    partition: row.get("partition"),
                    data: row.get("data"),
                    error_message: row.get("error_message"),
                    retry_count: row.get("retry_count"),
                    first_failed_at: row.get("first_failed_at"),
                    last_failed_at: row.get("last_failed_at"),
                    status: DeadLetterStatus::parse(&status)?,
                    resolved_at: row.get("resolved_at"),
                    resolution_notes: row.get("resolution_notes"),
                })
            })
            .collect()
    }

    /// Count pending entries. Useful for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM broker_dead_letter WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    pub async fn mark_resolved(&self, id: i64, notes: Option<&str>) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE broker_dead_letter
             SET status = 'resolved', resolved_at = NOW(), resolution_notes = $1
             WHERE id = $2",
        )
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::info!(dead_letter_id = id, "Dead-letter entry resolved");
        Ok(())
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE broker_dead_letter
             SET status = 'discarded', resolved_at = NOW(), resolution_notes = $1
             WHERE id = $2",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::warn!(dead_letter_id = id, reason, "Dead-letter entry discarded");
        metrics::counter!("transit.dead_letter.discarded").increment(1);
        Ok(())
    }

    /// Requeue a dead-lettered row back into `consumer_queue` with a fresh
    /// retry counter, marking the entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::RowNotFound`] if the id does not exist, or
    /// [`QueueError::Database`] if the requeue fails.
    pub async fn requeue(&self, id: i64) -> Result<i64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let entry = sqlx::query(
            "SELECT topic, partition, data FROM broker_dead_letter WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::RowNotFound(id))?;

        let topic: String = entry.get("topic");
        let partition: i32 = entry.get("partition");
        let data: Vec<u8> = entry.get("data");

        let (new_id,): (i64,) = sqlx::query_as(
            "INSERT INTO consumer_queue (topic, partition, data) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&topic)
        .bind(partition)
        .bind(&data)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("SELECT pg_notify($1, ''), pg_notify($2, '')")
            .bind(crate::consumer_queue::CONSUMER_QUEUE_CHANNEL)
            .bind(&topic)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE broker_dead_letter
             SET status = 'resolved', resolved_at = NOW(), resolution_notes = 'requeued'
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(dead_letter_id = id, new_id, topic = %topic, "Dead-letter entry requeued");
        metrics::counter!("transit.dead_letter.requeued").increment(1);

        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            let parsed = DeadLetterStatus::parse(status.as_str());
            assert!(matches!(parsed, Ok(s) if s == status));
        }
    }

    #[test]
    fn status_invalid() {
        assert!(DeadLetterStatus::parse("invalid").is_err());
    }
}
