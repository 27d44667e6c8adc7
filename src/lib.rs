//! casmesh - distributed content-addressable cache coordination
//!
//! Nodes publish which content hashes they hold, share that index through
//! periodic checkpoints, copy content between peers on demand and agree on
//! a single checkpoint-producing master from recent activity.

pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod lifecycle;
pub mod location;
pub mod monitor;
pub mod node;
pub mod retry;
pub mod transfer;
pub mod ui;

pub use error::{MeshError, MeshResult};
