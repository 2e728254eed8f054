//! Service wrappers: lifecycle for the long-lived broker activities.
//!
//! A wrapper binds a component's setup/run/teardown to a host lifecycle.
//! [`ServiceRunner`] drives long-lived loops (`dispatch_forever`-style);
//! [`PeriodicRunner`] invokes a callback on a fixed interval. Both stop
//! cooperatively through a shared watch channel: in-flight work completes,
//! then `destroy()` runs.
//!
//! The wrappers are the failure-recovery boundary: an error escaping a core
//! loop is logged here and stops the runner with a mapped exit code.
//! Operators restart the process.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Failure classification for host wrappers, mapped to process exit codes.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Invalid or missing configuration. Exit code 1.
    #[error("configuration error: {0}")]
    Config(String),

    /// The database was unavailable at startup. Exit code 2.
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// The external transport was unavailable at startup. Exit code 3.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Any other runtime failure. Exit code 1.
    #[error("service failure: {0}")]
    Runtime(String),
}

impl ServiceError {
    /// The process exit code for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Runtime(_) => 1,
            Self::DatabaseUnavailable(_) => 2,
            Self::BrokerUnavailable(_) => 3,
        }
    }
}

/// Map a service outcome to the process exit code (0 on clean stop).
#[must_use]
pub const fn exit_code(result: &Result<(), ServiceError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    }
}

/// A long-lived background activity with a setup/run/teardown lifecycle.
pub trait BackgroundService: Send + Sync {
    /// Name for diagnostics.
    fn name(&self) -> &str;

    /// One-time initialization before the loop starts.
    fn setup(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async { Ok(()) })
    }

    /// The core loop; must return promptly once `shutdown` flips to `true`.
    fn run(&self, shutdown: watch::Receiver<bool>) -> BoxFuture<'_, Result<(), ServiceError>>;

    /// Teardown after the loop exits.
    fn destroy(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Drives a set of [`BackgroundService`]s and coordinates their shutdown.
pub struct ServiceRunner {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<Result<(), ServiceError>>)>,
}

impl Default for ServiceRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRunner {
    /// Create an empty runner.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver on the runner's shutdown channel.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start a service: run `setup()`, then spawn its loop.
    pub fn spawn(&mut self, service: Arc<dyn BackgroundService>) {
        let name = service.name().to_string();
        let shutdown = self.shutdown_tx.subscribe();

        tracing::info!(service = %name, "Starting service");
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            service.setup().await?;
            let result = service.run(shutdown).await;
            if let Err(e) = &result {
                tracing::error!(service = %task_name, error = %e, "Service loop failed");
            }
            service.destroy().await?;
            result
        });

        self.handles.push((name, handle));
    }

    /// Signal shutdown and wait for every service to finish.
    ///
    /// Returns the first failure, if any. A service that does not stop
    /// within `timeout` is aborted and reported as a runtime failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`ServiceError`] produced by a stopping service.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ServiceError> {
        tracing::info!(services = self.handles.len(), "Shutting down services");
        // Receivers observe the flip at their next await point.
        let _ = self.shutdown_tx.send(true);

        let mut first_error = None;
        for (name, handle) in self.handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(Ok(()))) => {
                    tracing::info!(service = %name, "Service stopped cleanly");
                }
                Ok(Ok(Err(e))) => {
                    tracing::error!(service = %name, error = %e, "Service stopped with error");
                    first_error.get_or_insert(e);
                }
                Ok(Err(join_error)) => {
                    tracing::error!(service = %name, error = %join_error, "Service task panicked");
                    first_error.get_or_insert(ServiceError::Runtime(join_error.to_string()));
                }
                Err(_elapsed) => {
                    tracing::error!(service = %name, "Service did not stop in time, aborting");
                    first_error
                        .get_or_insert(ServiceError::Runtime(format!("{name} shutdown timed out")));
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Invokes an async callback on a fixed interval until shutdown.
pub struct PeriodicRunner {
    name: String,
    interval: Duration,
}

impl PeriodicRunner {
    /// Create a periodic runner with the given tick interval.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    /// Run `callback` every tick until `shutdown` flips to `true`.
    ///
    /// A failing tick is logged and the schedule continues; the callback's
    /// own error handling decides what is fatal.
    pub async fn run<F>(&self, mut shutdown: watch::Receiver<bool>, mut callback: F)
    where
        F: AsyncFnMut() -> Result<(), ServiceError>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = callback().await {
                        tracing::error!(service = %self.name, error = %e, "Periodic callback failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(service = %self.name, "Periodic runner stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(ServiceError::Config("x".into()))), 1);
        assert_eq!(exit_code(&Err(ServiceError::DatabaseUnavailable("x".into()))), 2);
        assert_eq!(exit_code(&Err(ServiceError::BrokerUnavailable("x".into()))), 3);
        assert_eq!(exit_code(&Err(ServiceError::Runtime("x".into()))), 1);
    }

    struct CountingService {
        ran: Arc<AtomicU32>,
        destroyed: Arc<AtomicU32>,
    }

    impl BackgroundService for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, mut shutdown: watch::Receiver<bool>) -> BoxFuture<'_, Result<(), ServiceError>> {
            let ran = Arc::clone(&self.ran);
            Box::pin(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                loop {
                    shutdown.changed().await.map_err(|e| ServiceError::Runtime(e.to_string()))?;
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            })
        }

        fn destroy(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
            let destroyed = Arc::clone(&self.destroyed);
            Box::pin(async move {
                destroyed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn runner_starts_and_stops_services() {
        let ran = Arc::new(AtomicU32::new(0));
        let destroyed = Arc::new(AtomicU32::new(0));

        let mut runner = ServiceRunner::new();
        runner.spawn(Arc::new(CountingService {
            ran: Arc::clone(&ran),
            destroyed: Arc::clone(&destroyed),
        }));

        // Let the service enter its loop before stopping it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        runner.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn periodic_runner_ticks_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);

        let runner = PeriodicRunner::new("tick", Duration::from_millis(10));
        let task = tokio::spawn(async move {
            runner
                .run(rx, async move || {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
