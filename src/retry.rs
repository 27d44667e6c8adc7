//! Bounded retries for outbound calls
//!
//! A [`RetryPolicy`] is built once from configuration and is plain data
//! afterwards, so it can be cloned or shared across concurrent callers.
//! Attempts for one call are strictly sequential and spaced by the
//! configured interval. Only transient errors are retried.

use crate::config::schema::RetryConfig;
use crate::error::{MeshError, MeshResult};
use crate::lifecycle::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry settings for one client configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.interval_seconds),
            config.max_attempts,
        )
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `op` receives the 1-based attempt number. After the last attempt the
    /// final transient error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> MeshResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        self.run_inner(operation, op, None).await
    }

    /// Like [`RetryPolicy::run`], but abandons the wait between attempts
    /// with [`MeshError::Cancelled`] once `signal` fires
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
        signal: &ShutdownSignal,
    ) -> MeshResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        self.run_inner(operation, op, Some(signal.clone())).await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
        mut signal: Option<ShutdownSignal>,
    ) -> MeshResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if signal.as_ref().is_some_and(ShutdownSignal::is_triggered) {
                return Err(MeshError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Transient failure, retrying in {:?}: {}",
                        self.interval,
                        e
                    );
                }
                Err(e) => return Err(e),
            }

            match signal.as_mut() {
                Some(signal) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => {}
                        _ = signal.wait() => return Err(MeshError::Cancelled),
                    }
                }
                None => tokio::time::sleep(self.interval).await,
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
