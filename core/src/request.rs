//! Request/response model handed to user callbacks.
//!
//! The consumer dispatcher wraps every decoded envelope in a [`Request`]
//! before invoking the registered callback. The request carries the envelope
//! together with an explicit [`Context`]: the request-scoped state (`user`,
//! `reply_topic`, `trace`) that downstream `send()` calls default from.
//!
//! Context is an explicit value, not an implicit global: it is cloned into
//! every spawned task that needs it, which gives copy-on-spawn semantics for
//! free.

use crate::message::{BrokerMessage, CodecError, Trace};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

/// Request-scoped state threaded through a callback invocation.
///
/// The dispatcher binds `user` and `reply_topic` from the incoming envelope
/// and `trace` from its causal chain; publishers use these as defaults when
/// the caller does not pass explicit values.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// User bound for the duration of the callback, if the envelope carried one.
    pub user: Option<Uuid>,
    /// Reply topic downstream `send()` calls default to.
    pub reply_topic: Option<String>,
    /// Causal chain of the message being handled.
    pub trace: Option<Trace>,
}

impl Context {
    /// Build the context bound for the duration of one callback.
    #[must_use]
    pub fn for_message(message: &BrokerMessage) -> Self {
        Self {
            user: message.user,
            reply_topic: message.reply_topic.clone(),
            trace: Some(message.trace.clone()),
        }
    }

    /// Return a copy with the reply topic replaced.
    #[must_use]
    pub fn with_reply_topic(mut self, reply_topic: impl Into<String>) -> Self {
        self.reply_topic = Some(reply_topic.into());
        self
    }
}

/// A decoded envelope plus its bound [`Context`], as seen by a callback.
#[derive(Debug, Clone)]
pub struct Request {
    message: BrokerMessage,
    context: Context,
}

impl Request {
    /// Wrap an envelope, binding a fresh context from its fields.
    #[must_use]
    pub fn new(message: BrokerMessage) -> Self {
        let context = Context::for_message(&message);
        Self { message, context }
    }

    /// The raw envelope.
    #[must_use]
    pub const fn message(&self) -> &BrokerMessage {
        &self.message
    }

    /// The bound request context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// The user the envelope was produced on behalf of, if any.
    #[must_use]
    pub const fn user(&self) -> Option<Uuid> {
        self.message.user
    }

    /// The raw payload bytes.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.message.data
    }

    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the payload does not parse as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        bincode::deserialize(&self.message.data).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// Successful outcome of a callback: the reply payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    data: Vec<u8>,
}

impl Response {
    /// Build a response from raw payload bytes.
    #[must_use]
    pub const fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Build a response by encoding a value with the envelope codec.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let data = bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self { data })
    }

    /// The reply payload bytes.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.data
    }

    /// Consume the response, returning the payload bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Failure classification of a callback.
///
/// The split drives the reply status and the retry policy: an application
/// error is a fact about the request (`status = ERROR`, events are dropped),
/// a system error is a fault of the service (`status = SYSTEM_ERROR`, events
/// are retried).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A known application error raised by the callback.
    #[error("application error: {0}")]
    Application(String),

    /// Any other failure inside the callback.
    #[error("system error: {0}")]
    System(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::TraceStep;

    fn sample_message() -> BrokerMessage {
        let trace = Trace::origin(TraceStep::new(Uuid::new_v4(), "order"));
        BrokerMessage::new("AddOrder", bincode::serialize(&42u32).unwrap(), trace)
            .with_reply_topic("fooReply")
            .with_user(Uuid::from_u128(7))
    }

    #[test]
    fn context_binds_envelope_fields() {
        let message = sample_message();
        let request = Request::new(message.clone());

        assert_eq!(request.context().user, Some(Uuid::from_u128(7)));
        assert_eq!(request.context().reply_topic.as_deref(), Some("fooReply"));
        assert_eq!(request.context().trace.as_ref(), Some(&message.trace));
    }

    #[test]
    fn request_decodes_payload() {
        let request = Request::new(sample_message());
        let value: u32 = request.decode().unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn response_encode_roundtrip() {
        let response = Response::encode(&"ok").unwrap();
        let decoded: String = bincode::deserialize(response.content()).unwrap();
        assert_eq!(decoded, "ok");
    }

    #[test]
    fn handler_error_display() {
        let err = HandlerError::Application("bad ticket".into());
        assert_eq!(err.to_string(), "application error: bad ticket");
    }
}
