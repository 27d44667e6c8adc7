//! CLI command implementations

pub mod checkpoint;
pub mod config;
pub mod monitor;
pub mod serve;
pub mod teardown;

pub use checkpoint::execute as checkpoint;
pub use config::execute as config;
pub use monitor::execute as monitor;
pub use serve::execute as serve;
pub use teardown::execute as teardown;
