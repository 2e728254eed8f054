//! The unified broker envelope and its binary codec.
//!
//! Every message that crosses the bus — events, commands and command replies —
//! is carried by the same [`BrokerMessage`] envelope. The envelope is an
//! immutable value: routing metadata plus an opaque, codec-serialized payload.
//!
//! # Trace chain
//!
//! Instead of a single correlation id, every envelope carries a [`Trace`]: an
//! ordered chain of `(identifier, service_name)` pairs. Each `send()` appends
//! one [`TraceStep`], so the chain records causality from the originating
//! service to the current hop. The envelope's identifier is the identifier of
//! the *last* step.
//!
//! # Codec
//!
//! Envelopes are serialized with `bincode`. The codec is injective and
//! preserves field equality: `decode(encode(m)) == m` for every valid
//! envelope. Decoding is the only validation point — bytes that do not parse,
//! or parse into an envelope with an empty trace, fail with [`CodecError`].
//!
//! # Example
//!
//! ```
//! use transit_core::message::{BrokerMessage, Trace, TraceStep};
//! use uuid::Uuid;
//!
//! let trace = Trace::origin(TraceStep::new(Uuid::new_v4(), "order"));
//! let message = BrokerMessage::new("TicketAdded", vec![1, 2, 3], trace);
//!
//! let bytes = message.encode().expect("encoding should succeed");
//! let decoded = BrokerMessage::decode(&bytes).expect("decoding should succeed");
//! assert_eq!(message, decoded);
//! ```

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The envelope could not be serialized to bytes.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The bytes could not be deserialized into an envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The bytes decoded into an envelope whose trace chain is empty.
    #[error("malformed envelope: trace chain is empty")]
    EmptyTrace,
}

/// One hop in the causal chain of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Unique identifier of this hop.
    pub identifier: Uuid,
    /// Name of the service that appended this hop.
    pub service_name: String,
}

impl TraceStep {
    /// Create a new trace step.
    pub fn new(identifier: Uuid, service_name: impl Into<String>) -> Self {
        Self {
            identifier,
            service_name: service_name.into(),
        }
    }
}

/// Ordered, non-empty chain of [`TraceStep`]s.
///
/// Non-emptiness is guaranteed by construction: a `Trace` starts from an
/// origin step and can only grow. Chains are short in practice — a handful of
/// hops — so steps are stored inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace(SmallVec<[TraceStep; 4]>);

impl Trace {
    /// Create a trace with a single originating step.
    #[must_use]
    pub fn origin(step: TraceStep) -> Self {
        Self(smallvec![step])
    }

    /// Create a trace from existing steps.
    ///
    /// Returns `None` if `steps` is empty.
    #[must_use]
    pub fn from_steps(steps: impl IntoIterator<Item = TraceStep>) -> Option<Self> {
        let steps: SmallVec<[TraceStep; 4]> = steps.into_iter().collect();
        if steps.is_empty() { None } else { Some(Self(steps)) }
    }

    /// Append a step to the end of the chain.
    pub fn push(&mut self, step: TraceStep) {
        self.0.push(step);
    }

    /// Return a copy of this trace with one more step appended.
    #[must_use]
    pub fn extended(&self, step: TraceStep) -> Self {
        let mut trace = self.clone();
        trace.push(step);
        trace
    }

    /// The last (most recent) step of the chain.
    #[must_use]
    pub fn last(&self) -> &TraceStep {
        // Non-empty by construction.
        &self.0[self.0.len() - 1]
    }

    /// All steps, origin first.
    #[must_use]
    pub fn steps(&self) -> &[TraceStep] {
        &self.0
    }

    /// Number of hops in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// A trace is never empty; provided for completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Application-level outcome carried by a reply envelope.
///
/// The discriminants mirror the HTTP-flavored codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageStatus {
    /// The producer considers the operation successful.
    Success = 200,
    /// The callback raised a known application error.
    Error = 400,
    /// The callback raised an unexpected error.
    SystemError = 500,
}

impl MessageStatus {
    /// Numeric wire code of this status.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// Delivery mode of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStrategy {
    /// Delivered to one member of each subscriber group, in partition order.
    Unicast,
    /// Fanned out across partitions; no single-partition ordering claim.
    Multicast,
}

impl MessageStrategy {
    /// Database string representation (the `producer_queue.strategy` column).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Multicast => "multicast",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the string names no strategy.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "unicast" => Ok(Self::Unicast),
            "multicast" => Ok(Self::Multicast),
            other => Err(CodecError::Malformed(format!("unknown strategy: {other}"))),
        }
    }
}

/// The unified on-wire envelope.
///
/// Carries the destination topic, the codec-serialized payload, optional
/// routing metadata (`reply_topic`, `user`), the application-level
/// [`MessageStatus`], the delivery [`MessageStrategy`], the causal [`Trace`]
/// and free-form string headers.
///
/// Envelopes are totally ordered by `(topic, identifier)`, which gives
/// priority queues a stable tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Topic the message is published on.
    pub topic: String,
    /// Opaque, codec-serialized payload.
    pub data: Vec<u8>,
    /// Topic on which a reply is expected, if any.
    pub reply_topic: Option<String>,
    /// The user on whose behalf the message was produced, if any.
    pub user: Option<Uuid>,
    /// Application-level outcome.
    pub status: MessageStatus,
    /// Delivery mode. Immutable after construction.
    pub strategy: MessageStrategy,
    /// Causal chain from origin to the current hop. Never empty.
    pub trace: Trace,
    /// Free-form string headers.
    pub headers: BTreeMap<String, String>,
}

impl BrokerMessage {
    /// Create an envelope with default status ([`MessageStatus::Success`]),
    /// default strategy ([`MessageStrategy::Unicast`]) and empty headers.
    pub fn new(topic: impl Into<String>, data: Vec<u8>, trace: Trace) -> Self {
        Self {
            topic: topic.into(),
            data,
            reply_topic: None,
            user: None,
            status: MessageStatus::Success,
            strategy: MessageStrategy::Unicast,
            trace,
            headers: BTreeMap::new(),
        }
    }

    /// Set the reply topic.
    #[must_use]
    pub fn with_reply_topic(mut self, reply_topic: impl Into<String>) -> Self {
        self.reply_topic = Some(reply_topic.into());
        self
    }

    /// Set the user.
    #[must_use]
    pub const fn with_user(mut self, user: Uuid) -> Self {
        self.user = Some(user);
        self
    }

    /// Set the status.
    #[must_use]
    pub const fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the delivery strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: MessageStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Identifier of the envelope: the identifier of the last trace step.
    #[must_use]
    pub fn identifier(&self) -> Uuid {
        self.trace.last().identifier
    }

    /// Name of the service that produced the last hop.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.trace.last().service_name
    }

    /// Whether the envelope reports a successful outcome.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status == MessageStatus::Success
    }

    /// Serialize this envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize an envelope from bytes.
    ///
    /// This is the only validation point for incoming bytes: unknown trailing
    /// data and missing fields fail here, as does an envelope whose trace
    /// chain is empty.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the bytes do not parse, or
    /// [`CodecError::EmptyTrace`] if they parse into an envelope without a
    /// single trace step.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let message: Self =
            bincode::deserialize(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if message.trace.0.is_empty() {
            return Err(CodecError::EmptyTrace);
        }
        Ok(message)
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BrokerMessage {{ topic: {}, identifier: {}, status: {}, size: {} bytes }}",
            self.topic,
            self.identifier(),
            self.status.code(),
            self.data.len()
        )
    }
}

impl PartialOrd for BrokerMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BrokerMessage {
    /// Total order by `(topic, identifier)` for priority-queue tie-breaking.
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.topic, self.identifier()).cmp(&(&other.topic, other.identifier()))
    }
}

/// Payload shape of event-kind messages.
///
/// Events are facts about an aggregate. The consumer dispatcher decodes this
/// from `BrokerMessage::data` to serialize processing per aggregate: entries
/// with the same `uuid` run in ascending `version` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Identifier of the aggregate the event belongs to.
    pub uuid: Uuid,
    /// Aggregate type name, e.g. `"Ticket"`.
    pub name: String,
    /// Monotonically increasing aggregate version.
    pub version: u32,
    /// Codec-serialized aggregate difference.
    pub payload: Vec<u8>,
}

impl EventData {
    /// Create a new event payload.
    pub fn new(uuid: Uuid, name: impl Into<String>, version: u32, payload: Vec<u8>) -> Self {
        Self {
            uuid,
            name: name.into(),
            version,
            payload,
        }
    }

    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the bytes do not parse.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> BrokerMessage {
        let trace = Trace::origin(TraceStep::new(Uuid::new_v4(), "order"));
        BrokerMessage::new("TicketAdded", vec![1, 2, 3], trace)
            .with_reply_topic("TicketAddedReply")
            .with_user(Uuid::new_v4())
    }

    #[test]
    fn encode_decode_roundtrip() {
        let message = sample_message();
        let bytes = message.encode().expect("encoding should succeed");
        let decoded = BrokerMessage::decode(&bytes).expect("decoding should succeed");
        assert_eq!(message, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = BrokerMessage::decode(b"garbage");
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn identifier_is_last_trace_step() {
        let origin = TraceStep::new(Uuid::new_v4(), "order");
        let tail = TraceStep::new(Uuid::new_v4(), "payment");
        let trace = Trace::origin(origin).extended(tail.clone());
        let message = BrokerMessage::new("t", vec![], trace);

        assert_eq!(message.identifier(), tail.identifier);
        assert_eq!(message.service_name(), "payment");
    }

    #[test]
    fn trace_from_steps_rejects_empty() {
        assert!(Trace::from_steps([]).is_none());
    }

    #[test]
    fn status_codes() {
        assert_eq!(MessageStatus::Success.code(), 200);
        assert_eq!(MessageStatus::Error.code(), 400);
        assert_eq!(MessageStatus::SystemError.code(), 500);
    }

    #[test]
    fn strategy_string_roundtrip() {
        for strategy in [MessageStrategy::Unicast, MessageStrategy::Multicast] {
            let parsed = MessageStrategy::parse(strategy.as_str()).unwrap();
            assert_eq!(strategy, parsed);
        }
        assert!(MessageStrategy::parse("broadcast").is_err());
    }

    #[test]
    fn ordering_by_topic_then_identifier() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        let a = BrokerMessage::new("a", vec![], Trace::origin(TraceStep::new(high, "s")));
        let b = BrokerMessage::new("b", vec![], Trace::origin(TraceStep::new(low, "s")));
        assert!(a < b);

        let c = BrokerMessage::new("a", vec![], Trace::origin(TraceStep::new(low, "s")));
        assert!(c < a);
    }

    #[test]
    fn event_data_roundtrip() {
        let event = EventData::new(Uuid::new_v4(), "Ticket", 3, vec![9, 9]);
        let bytes = event.encode().unwrap();
        assert_eq!(event, EventData::decode(&bytes).unwrap());
    }

    #[test]
    fn display_includes_topic_and_size() {
        let message = sample_message();
        let display = format!("{message}");
        assert!(display.contains("TicketAdded"));
        assert!(display.contains("3 bytes"));
    }

    proptest! {
        #[test]
        fn codec_roundtrip_preserves_equality(
            topic in "[a-zA-Z0-9]{1,16}",
            data in proptest::collection::vec(any::<u8>(), 0..64),
            hops in 1usize..5,
        ) {
            let mut steps = (0..hops).map(|i| TraceStep::new(Uuid::from_u128(i as u128 + 1), format!("svc{i}")));
            let mut trace = Trace::origin(steps.next().unwrap());
            for step in steps {
                trace.push(step);
            }
            let message = BrokerMessage::new(topic, data, trace);
            let decoded = BrokerMessage::decode(&message.encode().unwrap()).unwrap();
            prop_assert_eq!(message, decoded);
        }
    }
}
