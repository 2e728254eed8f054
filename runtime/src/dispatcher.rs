//! Consumer dispatcher: drains `consumer_queue` into user callbacks.
//!
//! One dispatcher instance serves one message kind — events, commands (and
//! queries), or command replies — over the topic set its routes cover. The
//! loop sleeps on the per-topic `LISTEN` channels, claims batches under
//! `FOR UPDATE SKIP LOCKED`, and invokes callbacks with bounded concurrency.
//!
//! # Per-kind semantics
//!
//! - **Events** are grouped by aggregate: entries sharing a `uuid` run
//!   sequentially in ascending `version` order, different aggregates run in
//!   parallel. Application errors drop the event; system errors retry it.
//! - **Commands** always produce a reply on the envelope's `reply_topic`,
//!   carrying the command's trace and a status mapped from the callback
//!   outcome (`SUCCESS` / `ERROR` / `SYSTEM_ERROR`). The row is deleted once
//!   the reply is staged; only infrastructure failures retry it.
//! - **Command replies** invoke the callback (typically the saga engine) and
//!   ignore its return value.
//!
//! A row whose retry counter would reach the limit is moved to the
//! dead-letter table instead of being released for another attempt.

use crate::publisher::{CommandReplyBroker, PublishError};
use crate::retry::BackoffPolicy;
use crate::service::{BackgroundService, ServiceError};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use transit_core::enroute::{Callback, EnrouteKind, EnrouteRegistry};
use transit_core::message::{BrokerMessage, EventData, MessageStatus};
use transit_core::request::{HandlerError, Request, Response};
use transit_postgres::{ConsumerQueue, ConsumerRow, DeadLetterQueue, QueueError, QueueListener};
use uuid::Uuid;

/// Errors raised by the consumer dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A staging-queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A reply could not be staged.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Which message kind a dispatcher instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Event-kind topics: per-aggregate ordering, no replies.
    Event,
    /// Command- and query-kind topics: reply per entry.
    Command,
    /// Reply topics: fire the callback, ignore its result.
    CommandReply,
}

/// Tuning parameters for one consumer dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-batch row limit.
    pub records: i64,
    /// Rows reaching this retry count are dead-lettered.
    pub retry_limit: i32,
    /// Maximum callbacks in flight at once.
    pub concurrency: usize,
    /// Upper bound on one wait-for-notification tick.
    pub max_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            records: 10,
            retry_limit: 5,
            concurrency: 15,
            max_wait: Duration::from_secs(60),
        }
    }
}

/// One claimed row with its decoded envelope.
struct Entry {
    row: ConsumerRow,
    message: BrokerMessage,
    event: Option<EventData>,
}

/// The consumer dispatcher.
pub struct ConsumerDispatcher {
    kind: DispatchKind,
    topics: Vec<String>,
    routes: HashMap<String, Callback>,
    queue: ConsumerQueue,
    dead_letter: DeadLetterQueue,
    reply_broker: Option<Arc<CommandReplyBroker>>,
    config: DispatcherConfig,
}

impl ConsumerDispatcher {
    /// Build the event-kind dispatcher from the registry's event routes.
    #[must_use]
    pub fn for_events(
        queue: ConsumerQueue,
        dead_letter: DeadLetterQueue,
        registry: &EnrouteRegistry,
        config: DispatcherConfig,
    ) -> Self {
        let routes = routes_for_kinds(registry, &[EnrouteKind::Event]);
        Self {
            kind: DispatchKind::Event,
            topics: routes.keys().cloned().collect(),
            routes,
            queue,
            dead_letter,
            reply_broker: None,
            config,
        }
    }

    /// Build the command-kind dispatcher from the registry's command and
    /// query routes.
    #[must_use]
    pub fn for_commands(
        queue: ConsumerQueue,
        dead_letter: DeadLetterQueue,
        registry: &EnrouteRegistry,
        reply_broker: Arc<CommandReplyBroker>,
        config: DispatcherConfig,
    ) -> Self {
        let routes = routes_for_kinds(registry, &[EnrouteKind::Command, EnrouteKind::Query]);
        Self {
            kind: DispatchKind::Command,
            topics: routes.keys().cloned().collect(),
            routes,
            queue,
            dead_letter,
            reply_broker: Some(reply_broker),
            config,
        }
    }

    /// Build the reply-kind dispatcher: every topic routes to one callback
    /// (typically the saga engine's reply handler).
    #[must_use]
    pub fn for_replies(
        queue: ConsumerQueue,
        dead_letter: DeadLetterQueue,
        topics: Vec<String>,
        callback: Callback,
        config: DispatcherConfig,
    ) -> Self {
        let routes = topics
            .iter()
            .map(|topic| (topic.clone(), callback.clone()))
            .collect();
        Self {
            kind: DispatchKind::CommandReply,
            topics,
            routes,
            queue,
            dead_letter,
            reply_broker: None,
            config,
        }
    }

    /// The topics this dispatcher drains.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Run one dispatch cycle; returns the number of rows claimed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Queue`] if the batch cannot be claimed.
    /// Failures of individual entries are resolved per-row (release, retry
    /// or dead-letter) and do not fail the cycle.
    pub async fn dispatch(&self) -> Result<usize, DispatchError> {
        let rows = self
            .queue
            .fetch_batch(&self.topics, self.config.retry_limit, self.config.records)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let claimed = rows.len();
        tracing::debug!(kind = ?self.kind, batch = claimed, "Dispatching consumer batch");

        let mut entries = Vec::with_capacity(claimed);
        for row in rows {
            match self.decode_entry(row) {
                Ok(entry) => entries.push(entry),
                Err((row, error)) => self.fail(&row, &error).await?,
            }
        }

        let units = match self.kind {
            DispatchKind::Event => group_by_aggregate(entries),
            DispatchKind::Command | DispatchKind::CommandReply => {
                entries.into_iter().map(|entry| vec![entry]).collect()
            }
        };

        futures::stream::iter(units)
            .for_each_concurrent(self.config.concurrency, |unit| self.run_unit(unit))
            .await;

        Ok(claimed)
    }

    /// Run the dispatch loop until `shutdown` flips to `true`.
    ///
    /// In-flight callbacks run to completion before the loop exits; claimed
    /// rows of an interrupted batch are resolved normally. Database outages
    /// are survived by reconnecting with backoff.
    ///
    /// # Errors
    ///
    /// Reserved for unrecoverable failures; connection losses are retried
    /// internally.
    pub async fn dispatch_forever(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let backoff = BackoffPolicy::default();
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                tracing::info!(kind = ?self.kind, "Consumer dispatcher stopping");
                return Ok(());
            }

            match self.run_connected(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        kind = ?self.kind,
                        error = %e,
                        "Consumer loop lost its connection, reconnecting"
                    );
                    backoff.wait(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn run_connected(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), DispatchError> {
        let mut listener = QueueListener::connect(self.queue.pool()).await?;
        listener.listen_all(&self.topics).await?;
        tracing::debug!(kind = ?self.kind, topics = ?self.topics, "Consumer dispatcher listening");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let pending = self
                .queue
                .count_pending(&self.topics, self.config.retry_limit)
                .await?;
            if pending > 0 {
                self.dispatch().await?;
                continue;
            }

            tokio::select! {
                result = listener.wait(self.config.max_wait) => {
                    result?;
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Decode one claimed row. Malformed bytes hand the row back with the
    /// error text so the caller can resolve it via the failure path.
    fn decode_entry(&self, row: ConsumerRow) -> Result<Entry, (ConsumerRow, String)> {
        let message = match BrokerMessage::decode(&row.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(id = row.id, topic = %row.topic, error = %e, "Malformed envelope");
                metrics::counter!("transit.dispatcher.malformed").increment(1);
                return Err((row, format!("malformed envelope: {e}")));
            }
        };

        let event = if self.kind == DispatchKind::Event {
            match EventData::decode(&message.data) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(
                        id = row.id,
                        correlation = %message.identifier(),
                        error = %e,
                        "Malformed event payload"
                    );
                    return Err((row, format!("malformed event payload: {e}")));
                }
            }
        } else {
            None
        };

        Ok(Entry { row, message, event })
    }

    async fn run_unit(&self, unit: Vec<Entry>) {
        for entry in unit {
            let id = entry.row.id;
            if let Err(e) = self.dispatch_one(entry).await {
                // The row stays claimed; operators see it age. A healthier
                // database lets the next failure path resolve it.
                tracing::error!(id, error = %e, "Failed to resolve dispatched row");
            }
        }
    }

    /// Dispatch one entry and resolve its row.
    async fn dispatch_one(&self, entry: Entry) -> Result<(), DispatchError> {
        let correlation = entry.message.identifier();
        let Some(callback) = self.routes.get(&entry.message.topic) else {
            tracing::warn!(
                id = entry.row.id,
                topic = %entry.message.topic,
                correlation = %correlation,
                "No action registered for topic"
            );
            self.fail(&entry.row, "no action registered").await?;
            return Ok(());
        };

        tracing::info!(
            id = entry.row.id,
            topic = %entry.message.topic,
            correlation = %correlation,
            kind = ?self.kind,
            "Dispatching entry"
        );

        let outcome = invoke(callback, Request::new(entry.message.clone())).await;

        match self.kind {
            DispatchKind::Command => self.resolve_command(&entry, outcome).await,
            DispatchKind::Event | DispatchKind::CommandReply => {
                self.resolve_fire_and_forget(&entry, outcome).await
            }
        }
    }

    /// Command resolution: map the outcome to a reply, stage it, delete the
    /// row. Only infrastructure failures take the retry path.
    async fn resolve_command(
        &self,
        entry: &Entry,
        outcome: Result<Response, HandlerError>,
    ) -> Result<(), DispatchError> {
        let correlation = entry.message.identifier();
        let (payload, status) = match outcome {
            Ok(response) => (response.into_bytes(), MessageStatus::Success),
            Err(HandlerError::Application(reason)) => {
                tracing::info!(correlation = %correlation, reason = %reason, "Callback raised an application error");
                (error_payload(&reason), MessageStatus::Error)
            }
            Err(HandlerError::System(reason)) => {
                tracing::error!(correlation = %correlation, reason = %reason, "Callback raised a system error");
                (error_payload(&reason), MessageStatus::SystemError)
            }
        };

        let staged = match (&entry.message.reply_topic, &self.reply_broker) {
            (Some(reply_topic), Some(reply_broker)) => reply_broker
                .send(payload, reply_topic, &entry.message.trace, status)
                .await
                .map(|_id| ()),
            (None, _) => {
                tracing::warn!(correlation = %correlation, "Command without reply topic; skipping reply");
                Ok(())
            }
            (Some(_), None) => Err(PublishError::Queue(QueueError::Database(
                "no reply broker wired".to_string(),
            ))),
        };

        match staged {
            Ok(()) => {
                self.queue.mark_processed(entry.row.id).await?;
                metrics::counter!("transit.dispatcher.dispatched", "kind" => "command")
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(correlation = %correlation, error = %e, "Reply staging failed");
                self.fail(&entry.row, &e.to_string()).await
            }
        }
    }

    /// Event and reply resolution: application errors drop the row, system
    /// errors retry it.
    async fn resolve_fire_and_forget(
        &self,
        entry: &Entry,
        outcome: Result<Response, HandlerError>,
    ) -> Result<(), DispatchError> {
        let correlation = entry.message.identifier();
        match outcome {
            Ok(_) => {
                self.queue.mark_processed(entry.row.id).await?;
                metrics::counter!("transit.dispatcher.dispatched", "kind" => "event").increment(1);
                Ok(())
            }
            Err(HandlerError::Application(reason)) => {
                tracing::warn!(correlation = %correlation, reason = %reason, "Application error; dropping entry");
                self.queue.mark_processed(entry.row.id).await?;
                Ok(())
            }
            Err(HandlerError::System(reason)) => {
                tracing::error!(correlation = %correlation, reason = %reason, "System error; keeping entry");
                self.fail(&entry.row, &reason).await
            }
        }
    }

    /// Release a failed row, or bury it once the retry budget is spent.
    async fn fail(&self, row: &ConsumerRow, error: &str) -> Result<(), DispatchError> {
        resolve_failure(
            &self.queue,
            &self.dead_letter,
            row,
            self.config.retry_limit,
            error,
        )
        .await
    }
}

/// Collect the registry's routes for the given kinds into a topic map.
fn routes_for_kinds(registry: &EnrouteRegistry, kinds: &[EnrouteKind]) -> HashMap<String, Callback> {
    let mut routes = HashMap::new();
    for kind in kinds {
        for topic in registry.topics_for_kind(*kind) {
            if let Ok(route) = registry.callback_for_topic(&topic) {
                routes.insert(topic, route.callback.clone());
            }
        }
    }
    routes
}

/// Shared failure resolution: retry or dead-letter.
async fn resolve_failure(
    queue: &ConsumerQueue,
    dead_letter: &DeadLetterQueue,
    row: &ConsumerRow,
    retry_limit: i32,
    error: &str,
) -> Result<(), DispatchError> {
    if row.retry + 1 >= retry_limit {
        dead_letter.bury(row, error).await?;
    } else {
        queue.mark_failure(row.id).await?;
    }
    Ok(())
}

/// Invoke a callback, converting a panic into a system error.
async fn invoke(callback: &Callback, request: Request) -> Result<Response, HandlerError> {
    let future = (callback)(request);
    match tokio::spawn(future).await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(HandlerError::System(format!(
            "callback panicked: {join_error}"
        ))),
    }
}

/// Encode an error's string representation as a reply payload.
fn error_payload(reason: &str) -> Vec<u8> {
    bincode::serialize(reason).unwrap_or_else(|_| reason.as_bytes().to_vec())
}

/// Group event entries per aggregate, each group sorted by version.
///
/// Groups run concurrently; the entries inside one group run sequentially,
/// which gives per-aggregate causal ordering without global serialization.
fn group_by_aggregate(entries: Vec<Entry>) -> Vec<Vec<Entry>> {
    let mut grouped: HashMap<Uuid, Vec<Entry>> = HashMap::new();
    for entry in entries {
        let key = entry.event.as_ref().map_or(Uuid::nil(), |event| event.uuid);
        grouped.entry(key).or_default().push(entry);
    }

    let mut units: Vec<Vec<Entry>> = grouped.into_values().collect();
    for unit in &mut units {
        unit.sort_by_key(|entry| entry.event.as_ref().map_or(0, |event| event.version));
    }
    units
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use transit_core::message::{Trace, TraceStep};

    fn event_entry(uuid: Uuid, version: u32, id: i64) -> Entry {
        let event = EventData::new(uuid, "Ticket", version, vec![]);
        let trace = Trace::origin(TraceStep::new(Uuid::new_v4(), "test"));
        let message = BrokerMessage::new("TicketAdded", event.encode().unwrap(), trace);
        Entry {
            row: ConsumerRow {
                id,
                topic: "TicketAdded".to_string(),
                partition: 0,
                data: message.encode().unwrap(),
                retry: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            message,
            event: Some(event),
        }
    }

    #[test]
    fn grouping_orders_versions_within_aggregate() {
        let x = Uuid::from_u128(1);
        let y = Uuid::from_u128(2);
        let entries = vec![
            event_entry(x, 1, 1),
            event_entry(x, 3, 2),
            event_entry(x, 2, 3),
            event_entry(y, 1, 4),
        ];

        let units = group_by_aggregate(entries);
        assert_eq!(units.len(), 2);

        let x_unit = units
            .iter()
            .find(|unit| unit[0].event.as_ref().unwrap().uuid == x)
            .unwrap();
        let versions: Vec<u32> = x_unit
            .iter()
            .map(|entry| entry.event.as_ref().unwrap().version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let y_unit = units
            .iter()
            .find(|unit| unit[0].event.as_ref().unwrap().uuid == y)
            .unwrap();
        assert_eq!(y_unit.len(), 1);
    }

    #[test]
    fn error_payload_is_decodable() {
        let payload = error_payload("boom");
        let decoded: String = bincode::deserialize(&payload).unwrap();
        assert_eq!(decoded, "boom");
    }
}

impl BackgroundService for ConsumerDispatcher {
    fn name(&self) -> &str {
        match self.kind {
            DispatchKind::Event => "event-dispatcher",
            DispatchKind::Command => "command-dispatcher",
            DispatchKind::CommandReply => "command-reply-dispatcher",
        }
    }

    fn run(&self, shutdown: watch::Receiver<bool>) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            self.dispatch_forever(shutdown)
                .await
                .map_err(|e| ServiceError::Runtime(e.to_string()))
        })
    }
}
