//! Peer-to-peer copy protocol
//!
//! [`PeerCopyClient`] issues copy requests, pushes and deletes against other
//! machines through a [`PeerRegistry`]. Each outbound call is bounded by a
//! per-call timeout and wrapped in the client's [`RetryPolicy`]. On the
//! receiving side a [`PeerService`] handles the request; [`LocalPeer`] is
//! the handler backed by a machine's [`ContentStore`].

use crate::error::{MeshError, MeshResult};
use crate::location::hash::{ContentHash, MachineLocation};
use crate::location::index::ContentLocationIndex;
use crate::retry::RetryPolicy;
use crate::transfer::copier::CopyTransport;
use crate::transfer::result::{CopyOptions, CopyResult, DeleteOptions, DeleteResult, PushResult};
use crate::transfer::store::{staging_writer, ContentStore};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Receiving side of the copy protocol, one per machine
#[async_trait]
pub trait PeerService: Send + Sync {
    fn location(&self) -> &MachineLocation;

    /// Pull `hash` from `requester`; true once this machine holds it
    async fn handle_copy_request(
        &self,
        hash: &ContentHash,
        requester: &MachineLocation,
    ) -> MeshResult<bool>;

    /// Accept pushed bytes for `hash`
    async fn handle_push(
        &self,
        hash: &ContentHash,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> MeshResult<PushResult>;

    /// Remove this machine's replica of `hash`
    async fn handle_delete(&self, hash: &ContentHash) -> MeshResult<DeleteResult>;
}

/// Handler backed by a local content store
pub struct LocalPeer {
    location: MachineLocation,
    store: ContentStore,
    copier: Arc<dyn CopyTransport>,
    copy_timeout: Duration,
    online: AtomicBool,
}

impl LocalPeer {
    /// The store root is the machine location's root directory
    pub fn new(
        location: MachineLocation,
        copier: Arc<dyn CopyTransport>,
        copy_timeout: Duration,
    ) -> Self {
        let store = ContentStore::new(location.root());
        Self {
            location,
            store,
            copier,
            copy_timeout,
            online: AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Simulate the machine dropping off the network
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> MeshResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::PeerUnavailable(self.location.to_string()))
        }
    }
}

#[async_trait]
impl PeerService for LocalPeer {
    fn location(&self) -> &MachineLocation {
        &self.location
    }

    async fn handle_copy_request(
        &self,
        hash: &ContentHash,
        requester: &MachineLocation,
    ) -> MeshResult<bool> {
        self.ensure_online()?;
        if self.store.contains(hash).await {
            return Ok(true);
        }

        let staging = self.store.staging_file()?;
        let mut sink = staging_writer(&staging)?;

        let result = self
            .copier
            .copy_to(
                &requester.content_path(hash),
                &mut sink,
                None,
                &CopyOptions::with_timeout(self.copy_timeout),
            )
            .await;
        drop(sink);

        match result {
            CopyResult::Success { .. } => {}
            CopyResult::FileNotFound => {
                debug!(hash = %hash.short(), %requester, "Requester does not hold content");
                return Ok(false);
            }
            CopyResult::Timeout { .. } => return Err(MeshError::Timeout(self.copy_timeout)),
            CopyResult::Cancelled { .. } => return Err(MeshError::Cancelled),
            other => {
                warn!(hash = %hash.short(), %requester, "Copy request failed: {}", other);
                return Ok(false);
            }
        }

        let staged = self.store.seal(staging).await?;
        if staged.hash() != *hash {
            warn!(
                expected = %hash.short(),
                actual = %staged.hash().short(),
                "Pulled content does not match requested hash"
            );
            return Ok(false);
        }
        self.store.commit(staged).await?;
        Ok(true)
    }

    async fn handle_push(
        &self,
        hash: &ContentHash,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> MeshResult<PushResult> {
        self.ensure_online()?;
        if self.store.contains(hash).await {
            return Ok(PushResult::AlreadyPresent);
        }

        // Dropping `staged` on any path below removes the temporary file
        let staged = self.store.stage_from(stream).await?;
        if staged.hash() != *hash {
            return Ok(PushResult::HashMismatch {
                actual: staged.hash(),
            });
        }
        let bytes = staged.bytes();
        if self.store.commit(staged).await? {
            Ok(PushResult::Stored { bytes })
        } else {
            Ok(PushResult::AlreadyPresent)
        }
    }

    async fn handle_delete(&self, hash: &ContentHash) -> MeshResult<DeleteResult> {
        self.ensure_online()?;
        Ok(match self.store.remove(hash).await? {
            Some(bytes) => DeleteResult::Deleted { bytes },
            None => DeleteResult::NotFound,
        })
    }
}

/// Routes machine locations to their handlers
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<MachineLocation, Arc<dyn PeerService>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: Arc<dyn PeerService>) {
        let location = peer.location().clone();
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(location, peer);
    }

    pub fn unregister(&self, location: &MachineLocation) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location)
            .is_some()
    }

    pub fn get(&self, location: &MachineLocation) -> MeshResult<Arc<dyn PeerService>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(location)
            .cloned()
            .ok_or_else(|| MeshError::UnknownMachine(location.to_string()))
    }
}

/// Byte source for a push; reopened for every attempt
#[derive(Debug, Clone)]
pub enum PushSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl PushSource {
    async fn open(&self) -> MeshResult<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            Self::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        MeshError::ContentNotFound(path.display().to_string())
                    } else {
                        MeshError::io(format!("opening {}", path.display()), e)
                    }
                })?;
                Ok(Box::new(file))
            }
        }
    }
}

impl From<Vec<u8>> for PushSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

/// Results of a delete, per machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSummary {
    pub target: DeleteResult,
    /// Local-only deletes issued to other holders for a global delete
    pub propagated: BTreeMap<MachineLocation, DeleteResult>,
}

/// Outbound side of the copy protocol
pub struct PeerCopyClient {
    local: MachineLocation,
    registry: Arc<PeerRegistry>,
    index: Arc<ContentLocationIndex>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

async fn bounded<T>(
    budget: Duration,
    call: impl Future<Output = MeshResult<T>>,
) -> MeshResult<T> {
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| MeshError::Timeout(budget))?
}

impl PeerCopyClient {
    pub fn new(
        local: MachineLocation,
        registry: Arc<PeerRegistry>,
        index: Arc<ContentLocationIndex>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local,
            registry,
            index,
            retry,
            call_timeout,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Ask `target` to pull `hash` from this machine
    pub async fn request_copy(
        &self,
        hash: &ContentHash,
        target: &MachineLocation,
    ) -> MeshResult<bool> {
        let peer = self.registry.get(target)?;
        let (peer, local, budget) = (&peer, &self.local, self.call_timeout);

        let copied = self
            .retry
            .run("request_copy", move |_| {
                bounded(budget, peer.handle_copy_request(hash, local))
            })
            .await?;

        if copied {
            self.index.record(*hash, target.clone());
            info!(hash = %hash.short(), %target, "Copy request fulfilled");
        }
        Ok(copied)
    }

    /// Upload `source` to `target`
    pub async fn push_file(
        &self,
        hash: &ContentHash,
        source: &PushSource,
        target: &MachineLocation,
    ) -> MeshResult<PushResult> {
        let peer = self.registry.get(target)?;
        let (peer, budget) = (&peer, self.call_timeout);

        let result = self
            .retry
            .run("push_file", move |_| async move {
                // Each attempt restarts the stream from the beginning
                let mut stream = source.open().await?;
                bounded(budget, peer.handle_push(hash, &mut *stream)).await
            })
            .await?;

        if result.target_has_content() {
            self.index.record(*hash, target.clone());
        }
        debug!(hash = %hash.short(), %target, ?result, "Push finished");
        Ok(result)
    }

    /// Delete `hash` on `target`; a global delete then reaches every other holder
    pub async fn delete_file(
        &self,
        hash: &ContentHash,
        target: &MachineLocation,
        options: DeleteOptions,
    ) -> MeshResult<DeleteSummary> {
        let target_result = self.delete_one(hash, target).await?;

        let mut propagated = BTreeMap::new();
        if !options.local_only {
            let others: Vec<MachineLocation> = self
                .index
                .lookup(hash)
                .into_iter()
                .filter(|machine| machine != target)
                .collect();

            let results =
                join_all(others.iter().map(|machine| self.delete_one(hash, machine))).await;
            for (machine, result) in others.into_iter().zip(results) {
                let result = result.unwrap_or_else(|e| DeleteResult::Failed {
                    reason: e.to_string(),
                });
                propagated.insert(machine, result);
            }
        }

        info!(
            hash = %hash.short(),
            %target,
            local_only = options.local_only,
            propagated = propagated.len(),
            "Delete finished"
        );
        Ok(DeleteSummary {
            target: target_result,
            propagated,
        })
    }

    async fn delete_one(
        &self,
        hash: &ContentHash,
        target: &MachineLocation,
    ) -> MeshResult<DeleteResult> {
        let peer = self.registry.get(target)?;
        let (peer, budget) = (&peer, self.call_timeout);

        let result = self
            .retry
            .run("delete_file", move |_| bounded(budget, peer.handle_delete(hash)))
            .await?;

        if result.is_gone() {
            self.index.remove(hash, target);
        }
        Ok(result)
    }
}
