//! Content transfer between machines

pub mod copier;
pub mod peer;
pub mod result;
pub mod store;

pub use copier::{CopyTransport, FaultInjection, FileCopier};
pub use peer::{DeleteSummary, LocalPeer, PeerCopyClient, PeerRegistry, PeerService, PushSource};
pub use result::{
    CopyOptions, CopyResult, DeleteOptions, DeleteResult, ExistenceResult, PushResult,
};
pub use store::{staging_writer, ContentStore, StagedContent};
