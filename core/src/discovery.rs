//! Discovery-service connector interface.
//!
//! Registers the local service with an external directory on startup and
//! removes it on shutdown. Concrete connectors (Kong and friends) live
//! outside the broker core; the core only defines the seam.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a discovery connector.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// The directory rejected or failed the registration.
    #[error("discovery subscribe failed for '{name}': {reason}")]
    SubscribeFailed {
        /// Service name being registered.
        name: String,
        /// The reason for failure.
        reason: String,
    },

    /// The directory rejected or failed the deregistration.
    #[error("discovery unsubscribe failed for '{name}': {reason}")]
    UnsubscribeFailed {
        /// Service name being removed.
        name: String,
        /// The reason for failure.
        reason: String,
    },
}

/// One externally reachable endpoint of the local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// HTTP path.
    pub path: String,
    /// HTTP method.
    pub method: String,
}

/// Boxed future alias for the dyn-compatible trait methods.
pub type DiscoveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DiscoveryError>> + Send + 'a>>;

/// External service directory client.
pub trait DiscoveryClient: Send + Sync {
    /// Register the local service and its endpoints with the directory.
    ///
    /// Implementations retry up to `retry_tries` times with `retry_delay`
    /// seconds between attempts before failing.
    fn subscribe(
        &self,
        host: &str,
        port: u16,
        name: &str,
        endpoints: &[Endpoint],
        retry_tries: u32,
        retry_delay: f64,
    ) -> DiscoveryFuture<'_>;

    /// Remove the local service from the directory.
    fn unsubscribe(&self, name: &str, retry_tries: u32, retry_delay: f64) -> DiscoveryFuture<'_>;
}
