//! Node lifecycle context
//!
//! [`ServiceLifecycle`] is constructed once by the process bootstrap and
//! shared by reference with everything that needs to request teardown. It
//! drives a [`NodeHost`] through start, an open-ended running phase, and a
//! shutdown bounded by a timeout. The host's resources are released by a
//! drop guard, so they are disposed even when the stop hook hangs or the
//! run future itself is dropped.

use crate::error::{MeshError, MeshResult};
use crate::lifecycle::signal::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use crate::lifecycle::state::ServiceState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default bound on the shutdown phase
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Optional behaviour a host declares up front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// Accept teardown requests addressed by service id
    pub remote_teardown: bool,
}

/// The component a lifecycle starts and stops
#[async_trait]
pub trait NodeHost: Send + Sync {
    /// Declared once, read when the lifecycle is constructed
    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::default()
    }

    /// Build dependent infrastructure and start serving
    ///
    /// Background work should observe `shutdown` and unwind when it fires.
    async fn start(&self, shutdown: ShutdownSignal) -> MeshResult<()>;

    /// Resolves with the cause if the host breaks while running
    ///
    /// The lifecycle then stops the host and ends in `Failed`.
    async fn fault(&self) -> MeshError {
        std::future::pending().await
    }

    /// Wind down gracefully; may be abandoned after the shutdown timeout
    async fn stop(&self) -> MeshResult<()>;

    /// Release acquired resources; always runs exactly once after start begins
    fn dispose(&self);
}

struct DisposeGuard {
    host: Arc<dyn NodeHost>,
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.host.dispose();
        debug!("Host resources disposed");
    }
}

/// Lifecycle context for one node
pub struct ServiceLifecycle {
    service_id: String,
    host: Arc<dyn NodeHost>,
    capabilities: HostCapabilities,
    shutdown_timeout: Duration,
    state: watch::Sender<ServiceState>,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    started: AtomicBool,
}

impl ServiceLifecycle {
    pub fn new(service_id: impl Into<String>, host: Arc<dyn NodeHost>) -> Self {
        let capabilities = host.capabilities();
        let (trigger, signal) = shutdown_channel();
        Self {
            service_id: service_id.into(),
            host,
            capabilities,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: watch::Sender::new(ServiceState::Created),
            trigger,
            signal,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Signal that fires when shutdown is requested
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Request shutdown; returns false if it was already requested
    ///
    /// Safe to call at any point. During startup the request is held until
    /// startup settles.
    pub fn request_shutdown(&self) -> bool {
        let first = self.trigger.trigger();
        if first {
            info!(service_id = %self.service_id, state = %self.state(), "Shutdown requested");
        } else {
            debug!(service_id = %self.service_id, "Shutdown already requested");
        }
        first
    }

    /// Teardown addressed by service id; true if this service accepted it
    pub fn request_teardown(&self, service_id: &str) -> bool {
        if !self.capabilities.remote_teardown {
            debug!(service_id, "Host does not accept remote teardown");
            return false;
        }
        if service_id != self.service_id {
            debug!(service_id, own = %self.service_id, "Teardown addressed to another service");
            return false;
        }
        self.request_shutdown();
        true
    }

    /// Wait until the lifecycle reaches `Stopped` or `Failed`
    pub async fn wait_terminal(&self) -> ServiceState {
        let mut receiver = self.state.subscribe();
        let state = match receiver.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Start the host, run until shutdown is requested, then stop it
    ///
    /// Returns `Err(Startup)` if the host fails to start; the lifecycle is
    /// then `Failed` and is not restarted. Can only be called once.
    pub async fn run(&self) -> MeshResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState {
                state: self.state().to_string(),
                action: "start".to_string(),
            });
        }

        self.transition(ServiceState::Starting)?;
        info!(service_id = %self.service_id, "Starting node");
        let began = Instant::now();
        let dispose_guard = DisposeGuard {
            host: self.host.clone(),
        };

        if let Err(e) = self.host.start(self.signal.clone()).await {
            let elapsed = began.elapsed();
            self.transition(ServiceState::Failed)?;
            error!(
                service_id = %self.service_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Startup failed: {}",
                e
            );
            return Err(MeshError::Startup {
                reason: e.to_string(),
                elapsed,
            });
        }

        self.transition(ServiceState::Running)?;
        info!(
            service_id = %self.service_id,
            elapsed_ms = began.elapsed().as_millis() as u64,
            "Node running"
        );

        let mut signal = self.signal.clone();
        let fault = tokio::select! {
            _ = signal.wait() => None,
            cause = self.host.fault() => Some(cause),
        };

        match &fault {
            // Stay Running until resources are released; Failed is terminal
            Some(cause) => {
                error!(service_id = %self.service_id, error = %cause, "Stopping failed node");
                self.trigger.trigger();
            }
            None => self.transition(ServiceState::ShuttingDown)?,
        }
        info!(
            service_id = %self.service_id,
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Shutting down"
        );
        match tokio::time::timeout(self.shutdown_timeout, self.host.stop()).await {
            Ok(Ok(())) => debug!("Host stopped"),
            Ok(Err(e)) => warn!("Host stop failed: {}", e),
            Err(_) => warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Host stop did not finish in time; abandoning it"
            ),
        }

        drop(dispose_guard);
        if let Some(cause) = fault {
            self.transition(ServiceState::Failed)?;
            return Err(cause);
        }
        self.transition(ServiceState::Stopped)?;
        info!(service_id = %self.service_id, "Node stopped");
        Ok(())
    }

    fn transition(&self, next: ServiceState) -> MeshResult<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(from = %state, to = %next, "Lifecycle transition");
                *state = next;
                true
            } else {
                outcome = Err(MeshError::InvalidState {
                    state: state.to_string(),
                    action: format!("move to {}", next),
                });
                false
            }
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestHost {
        fail_start: bool,
        hang_stop: bool,
        start_delay: Option<Duration>,
        fault_after: Option<Duration>,
        teardown: bool,
        events: Mutex<Vec<&'static str>>,
        disposed: AtomicUsize,
    }

    impl TestHost {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeHost for TestHost {
        fn capabilities(&self) -> HostCapabilities {
            HostCapabilities {
                remote_teardown: self.teardown,
            }
        }

        async fn start(&self, _shutdown: ShutdownSignal) -> MeshResult<()> {
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            self.events.lock().unwrap().push("start");
            if self.fail_start {
                return Err(MeshError::Internal("copy transport unavailable".into()));
            }
            Ok(())
        }

        async fn fault(&self) -> MeshError {
            match self.fault_after {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    MeshError::Internal("restore loop exited".into())
                }
                None => std::future::pending().await,
            }
        }

        async fn stop(&self) -> MeshResult<()> {
            self.events.lock().unwrap().push("stop");
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for_state(lifecycle: &ServiceLifecycle, wanted: ServiceState) {
        let mut receiver = lifecycle.watch_state();
        receiver.wait_for(|state| *state == wanted).await.unwrap();
    }

    #[tokio::test]
    async fn runs_until_shutdown_requested() {
        let host = Arc::new(TestHost::default());
        let lifecycle = Arc::new(ServiceLifecycle::new("node-1", host.clone()));

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };
        wait_for_state(&lifecycle, ServiceState::Running).await;

        assert!(lifecycle.request_shutdown());
        runner.await.unwrap().unwrap();

        assert_eq!(lifecycle.state(), ServiceState::Stopped);
        assert_eq!(host.events(), vec!["start", "stop"]);
        assert_eq!(host.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_failure_is_fatal() {
        let host = Arc::new(TestHost {
            fail_start: true,
            ..Default::default()
        });
        let lifecycle = ServiceLifecycle::new("node-1", host.clone());

        let err = lifecycle.run().await.unwrap_err();

        assert!(matches!(err, MeshError::Startup { .. }));
        assert!(err.to_string().contains("copy transport unavailable"));
        assert_eq!(lifecycle.state(), ServiceState::Failed);
        assert_eq!(host.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(host.events(), vec!["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stop_is_abandoned_but_disposed() {
        let host = Arc::new(TestHost {
            hang_stop: true,
            ..Default::default()
        });
        let lifecycle = Arc::new(
            ServiceLifecycle::new("node-1", host.clone())
                .with_shutdown_timeout(Duration::from_secs(1)),
        );

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };
        wait_for_state(&lifecycle, ServiceState::Running).await;

        let began = Instant::now();
        lifecycle.request_shutdown();
        runner.await.unwrap().unwrap();
        let elapsed = began.elapsed();

        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(lifecycle.state(), ServiceState::Stopped);
        assert_eq!(host.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_startup_waits_for_start() {
        let host = Arc::new(TestHost {
            start_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let lifecycle = Arc::new(ServiceLifecycle::new("node-1", host.clone()));

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };
        wait_for_state(&lifecycle, ServiceState::Starting).await;

        assert!(lifecycle.request_shutdown());
        assert!(!lifecycle.request_shutdown());
        runner.await.unwrap().unwrap();

        assert_eq!(host.events(), vec!["start", "stop"]);
        assert_eq!(lifecycle.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn host_fault_while_running_ends_failed() {
        let host = Arc::new(TestHost {
            fault_after: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let lifecycle = Arc::new(ServiceLifecycle::new("node-1", host.clone()));

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_terminal().await })
        };
        let err = lifecycle.run().await.unwrap_err();

        assert!(err.to_string().contains("restore loop exited"));
        assert_eq!(lifecycle.state(), ServiceState::Failed);
        assert_eq!(waiter.await.unwrap(), ServiceState::Failed);
        assert!(lifecycle.shutdown_signal().is_triggered());
        assert_eq!(host.events(), vec!["start", "stop"]);
        assert_eq!(host.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_terminal_observes_stop() {
        let lifecycle = Arc::new(ServiceLifecycle::new("node-1", Arc::new(TestHost::default())));
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_terminal().await })
        };

        lifecycle.request_shutdown();
        lifecycle.run().await.unwrap();

        assert_eq!(waiter.await.unwrap(), ServiceState::Stopped);
        assert_eq!(lifecycle.wait_terminal().await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let host = Arc::new(TestHost::default());
        let lifecycle = ServiceLifecycle::new("node-1", host);
        lifecycle.request_shutdown();
        lifecycle.run().await.unwrap();

        let err = lifecycle.run().await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn teardown_follows_declared_capability() {
        let plain = ServiceLifecycle::new("node-1", Arc::new(TestHost::default()));
        assert!(!plain.request_teardown("node-1"));
        assert!(!plain.shutdown_signal().is_triggered());

        let host = Arc::new(TestHost {
            teardown: true,
            ..Default::default()
        });
        let lifecycle = ServiceLifecycle::new("node-1", host);
        assert!(!lifecycle.request_teardown("node-2"));
        assert!(lifecycle.request_teardown("node-1"));
        assert!(lifecycle.request_teardown("node-1"));
        assert!(lifecycle.shutdown_signal().is_triggered());
    }

    #[test]
    fn default_timeout_is_thirty_minutes() {
        let lifecycle = ServiceLifecycle::new("node-1", Arc::new(TestHost::default()));
        assert_eq!(lifecycle.shutdown_timeout(), Duration::from_secs(1800));
        assert_eq!(lifecycle.state(), ServiceState::Created);
    }
}
