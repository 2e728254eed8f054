//! LISTEN/NOTIFY wait primitive for the dispatchers.
//!
//! Every dispatcher owns one long-lived listening connection. Between
//! batches it sleeps here instead of polling: a staged row's `NOTIFY` wakes
//! it immediately, and a bounded `max_wait` tick guards against missed
//! notifications (the caller re-checks the pending count after every wake).

use crate::QueueError;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;

/// A long-lived listening connection over a set of channels.
pub struct QueueListener {
    inner: PgListener,
}

impl QueueListener {
    /// Open a listening connection from the given pool.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the connection cannot be opened.
    pub async fn connect(pool: &PgPool) -> Result<Self, QueueError> {
        let inner = PgListener::connect_with(pool).await?;
        Ok(Self { inner })
    }

    /// Start listening on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the `LISTEN` fails.
    pub async fn listen(&mut self, channel: &str) -> Result<(), QueueError> {
        self.inner.listen(channel).await?;
        Ok(())
    }

    /// Start listening on several channels at once.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if any `LISTEN` fails.
    pub async fn listen_all(&mut self, channels: &[String]) -> Result<(), QueueError> {
        let refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        self.inner.listen_all(refs).await?;
        Ok(())
    }

    /// Stop listening on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the `UNLISTEN` fails.
    pub async fn unlisten(&mut self, channel: &str) -> Result<(), QueueError> {
        self.inner.unlisten(channel).await?;
        Ok(())
    }

    /// Wait for a notification on any listened channel.
    ///
    /// Returns `true` if a notification arrived within `max_wait`, `false`
    /// on timeout. Either way the caller re-checks the pending count; a
    /// spurious or coalesced notification is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the listening connection fails.
    pub async fn wait(&mut self, max_wait: Duration) -> Result<bool, QueueError> {
        match tokio::time::timeout(max_wait, self.inner.recv()).await {
            Ok(Ok(notification)) => {
                tracing::trace!(channel = notification.channel(), "Notification received");
                Ok(true)
            }
            Ok(Err(e)) => Err(QueueError::Database(e.to_string())),
            Err(_elapsed) => Ok(false),
        }
    }
}
