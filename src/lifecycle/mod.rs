//! Service lifecycle and shutdown signalling

pub mod service;
pub mod signal;
pub mod state;

pub use service::{HostCapabilities, NodeHost, ServiceLifecycle, DEFAULT_SHUTDOWN_TIMEOUT};
pub use signal::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use state::ServiceState;
