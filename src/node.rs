//! Cache node wiring
//!
//! A [`CacheNode`] owns one machine's content store, its replica of the
//! location index and the timers that keep that replica in sync: a
//! heartbeat loop that re-evaluates the role, a creation loop that runs
//! while this machine is master and a restore loop that runs while it is
//! a worker. Reads that miss locally are served from other machines
//! listed in the index.

use crate::config::Config;
use crate::coordination::activity::{ActivityLog, ActivityRecord, Operation, OperationResult};
use crate::coordination::role::{Role, RoleCoordinator};
use crate::error::{MeshError, MeshResult};
use crate::lifecycle::{HostCapabilities, NodeHost, ShutdownSignal};
use crate::location::checkpoint::{
    CheckpointManager, CheckpointStore, FileCheckpointStore, RestoreOutcome,
};
use crate::location::hash::{ContentHash, MachineLocation};
use crate::location::index::ContentLocationIndex;
use crate::retry::RetryPolicy;
use crate::transfer::copier::{CopyTransport, FileCopier};
use crate::transfer::peer::{LocalPeer, PeerCopyClient, PeerRegistry};
use crate::transfer::result::{CopyOptions, CopyResult, ExistenceResult};
use crate::transfer::store::{staging_writer, ContentStore};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Timers, windows and budgets of one node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub stamp: String,
    pub create_interval: Duration,
    pub restore_interval: Duration,
    pub eviction_after: Option<chrono::Duration>,
    pub activity_window: chrono::Duration,
    pub master_window: chrono::Duration,
    /// Activity older than this is outside every reader's window
    pub activity_retention: chrono::Duration,
    pub copy_timeout: Duration,
    pub existence_timeout: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub remote_teardown: bool,
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        let minutes = |m: u64| chrono::Duration::minutes(m as i64);
        Self {
            stamp: config.node.stamp.clone(),
            create_interval: Duration::from_secs(config.checkpoint.create_interval_seconds),
            restore_interval: Duration::from_secs(config.checkpoint.restore_interval_seconds),
            eviction_after: match config.checkpoint.eviction_after_minutes {
                0 => None,
                m => Some(minutes(m)),
            },
            activity_window: minutes(config.roles.activity_window_minutes),
            master_window: minutes(config.roles.master_activity_window_minutes),
            activity_retention: minutes(
                config
                    .roles
                    .activity_window_minutes
                    .max(config.roles.master_activity_window_minutes)
                    .max(config.monitor.activity_period_minutes),
            ),
            copy_timeout: Duration::from_secs(config.transfer.copy_timeout_seconds),
            existence_timeout: Duration::from_secs(config.transfer.existence_check_timeout_seconds),
            call_timeout: Duration::from_secs(config.transfer.call_timeout_seconds),
            retry: RetryPolicy::from_config(&config.retry),
            remote_teardown: config.node.remote_teardown,
        }
    }
}

/// Shared state of the background loops
struct Coordinator {
    machine: MachineLocation,
    settings: NodeSettings,
    index: Arc<ContentLocationIndex>,
    checkpoints: CheckpointManager,
    roles: RoleCoordinator,
    activity: Arc<ActivityLog>,
    role: watch::Sender<Role>,
}

impl Coordinator {
    async fn heartbeat(&self) {
        self.activity
            .append(&ActivityRecord::now(
                &self.machine,
                &self.settings.stamp,
                Operation::Heartbeat,
                OperationResult::Success,
                None,
            ))
            .await;
    }

    async fn refresh_role(&self) -> Role {
        match self.roles.evaluate().await {
            Ok(role) => {
                let previous = self.role.send_replace(role);
                if previous != role {
                    info!(
                        stamp = %self.settings.stamp,
                        from = %previous,
                        to = %role,
                        "Role changed"
                    );
                }
                role
            }
            Err(e) => {
                warn!("Role evaluation failed, keeping current role: {}", e);
                self.current_role()
            }
        }
    }

    fn current_role(&self) -> Role {
        *self.role.borrow()
    }

    fn evict(&self) {
        if let Some(age) = self.settings.eviction_after {
            let evicted = self.index.evict_older_than(Utc::now() - age);
            if evicted > 0 {
                info!(evicted, "Evicted stale locations");
            }
        }
    }

    async fn prune_activity(&self) {
        let cutoff = Utc::now() - self.settings.activity_retention;
        if let Err(e) = self.activity.prune_before(cutoff).await {
            warn!("Failed to prune activity log: {}", e);
        }
    }

    async fn restore(&self) {
        match self.checkpoints.restore_latest().await {
            Ok(RestoreOutcome::Applied { sequence_number, stats }) => {
                debug!(sequence = sequence_number, ?stats, "Restored checkpoint");
            }
            Ok(RestoreOutcome::Skipped { watermark }) => {
                debug!(watermark, "No newer checkpoint to restore");
            }
            Ok(RestoreOutcome::NoneAvailable) => debug!("No checkpoint published yet"),
            Err(e) => warn!("Checkpoint restore failed: {}", e),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut stop: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.restore_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait() => break,
            }
            self.heartbeat().await;
            self.refresh_role().await;
            self.evict();
            self.prune_activity().await;
        }
        debug!("Heartbeat loop exited");
    }

    async fn create_loop(self: Arc<Self>, mut stop: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.create_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait() => break,
            }
            if self.current_role() != Role::Master {
                continue;
            }
            if let Err(e) = self.checkpoints.create_checkpoint().await {
                warn!("Checkpoint creation failed: {}", e);
            }
        }
        debug!("Checkpoint creation loop exited");
    }

    async fn restore_loop(self: Arc<Self>, mut stop: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.restore_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait() => break,
            }
            if self.current_role() != Role::Worker {
                continue;
            }
            tokio::select! {
                _ = self.restore() => {}
                _ = stop.wait() => break,
            }
        }
        debug!("Checkpoint restore loop exited");
    }
}

/// One machine of a stamp
pub struct CacheNode {
    local: Arc<LocalPeer>,
    copier: Arc<dyn CopyTransport>,
    registry: Arc<PeerRegistry>,
    client: PeerCopyClient,
    coordinator: Arc<Coordinator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    aborts: Mutex<Vec<AbortHandle>>,
    faults: Arc<watch::Sender<Option<String>>>,
}

impl CacheNode {
    pub fn new(
        machine: MachineLocation,
        settings: NodeSettings,
        copier: Arc<dyn CopyTransport>,
        registry: Arc<PeerRegistry>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        let index = Arc::new(ContentLocationIndex::new());
        let local = Arc::new(LocalPeer::new(
            machine.clone(),
            copier.clone(),
            settings.copy_timeout,
        ));
        let client = PeerCopyClient::new(
            machine.clone(),
            registry.clone(),
            index.clone(),
            settings.retry,
            settings.call_timeout,
        );
        let checkpoints = CheckpointManager::new(
            settings.stamp.clone(),
            machine.clone(),
            index.clone(),
            checkpoint_store,
            activity.clone(),
        );
        let roles = RoleCoordinator::new(
            machine.clone(),
            settings.stamp.clone(),
            activity.clone(),
            settings.master_window,
            settings.activity_window,
        );
        let (role, _) = watch::channel(Role::Worker);

        Self {
            local,
            copier,
            registry,
            client,
            coordinator: Arc::new(Coordinator {
                machine,
                settings,
                index,
                checkpoints,
                roles,
                activity,
                role,
            }),
            tasks: Mutex::new(vec![]),
            aborts: Mutex::new(vec![]),
            faults: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Build a node from configuration over the shared data root
    ///
    /// Configured peers are reachable through the same file copier.
    pub fn from_config(config: &Config) -> MeshResult<Self> {
        let machine = MachineLocation::from(config.machine_root()?);
        let settings = NodeSettings::from_config(config);
        let copier: Arc<dyn CopyTransport> = Arc::new(FileCopier::new());
        let registry = Arc::new(PeerRegistry::new());
        for peer in &config.node.peers {
            registry.register(Arc::new(LocalPeer::new(
                MachineLocation::from(peer.clone()),
                copier.clone(),
                settings.copy_timeout,
            )));
        }
        let store = Arc::new(FileCheckpointStore::new(
            config.data_root(),
            config.checkpoint.retained_checkpoints,
        ));
        let activity = Arc::new(ActivityLog::new(config.activity_log_dir()));
        Ok(Self::new(machine, settings, copier, registry, store, activity))
    }

    pub fn machine(&self) -> &MachineLocation {
        &self.coordinator.machine
    }

    pub fn stamp(&self) -> &str {
        &self.coordinator.settings.stamp
    }

    pub fn index(&self) -> &Arc<ContentLocationIndex> {
        &self.coordinator.index
    }

    pub fn store(&self) -> &ContentStore {
        self.local.store()
    }

    pub fn client(&self) -> &PeerCopyClient {
        &self.client
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.coordinator.checkpoints
    }

    pub fn role(&self) -> Role {
        self.coordinator.current_role()
    }

    /// Receiver that observes role changes
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.coordinator.role.subscribe()
    }

    /// Re-evaluate the role now
    pub async fn refresh_role(&self) -> Role {
        self.coordinator.refresh_role().await
    }

    /// Store content locally and record this machine as a holder
    pub async fn put(&self, content: &[u8]) -> MeshResult<ContentHash> {
        let hash = self.store().put(content).await?;
        self.index().record(hash, self.machine().clone());
        debug!(hash = %hash.short(), bytes = content.len(), "Stored content");
        Ok(hash)
    }

    /// Read content, copying it from another holder on a local miss
    ///
    /// Candidates are tried newest sighting first. A candidate whose bytes
    /// do not hash to `hash` is skipped. Returns `ContentNotFound` once
    /// every candidate is exhausted.
    pub async fn fetch(&self, hash: &ContentHash) -> MeshResult<Vec<u8>> {
        if self.store().contains(hash).await {
            return self.store().read(hash).await;
        }

        let candidates: Vec<MachineLocation> = self
            .index()
            .lookup_entries(hash)
            .into_iter()
            .map(|entry| entry.machine)
            .filter(|machine| machine != self.machine())
            .collect();

        for candidate in candidates {
            match self.fetch_from(hash, &candidate).await {
                Ok(true) => {
                    self.index().record(*hash, self.machine().clone());
                    info!(hash = %hash.short(), from = %candidate, "Fetched content from peer");
                    return self.store().read(hash).await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(hash = %hash.short(), from = %candidate, "Copy failed: {}", e);
                }
            }
        }

        Err(MeshError::ContentNotFound(hash.to_hex()))
    }

    /// Copy one candidate into the local store; false if it was unusable
    async fn fetch_from(
        &self,
        hash: &ContentHash,
        candidate: &MachineLocation,
    ) -> MeshResult<bool> {
        let settings = &self.coordinator.settings;
        let source = candidate.content_path(hash);

        let expected_size = match self
            .copier
            .check_file_exists(&source, settings.existence_timeout)
            .await
        {
            ExistenceResult::Exists { size } => Some(size),
            ExistenceResult::NotExists => {
                debug!(
                    hash = %hash.short(),
                    %candidate,
                    "Indexed location no longer holds content"
                );
                self.index().remove(hash, candidate);
                return Ok(false);
            }
            ExistenceResult::Error { reason } => {
                debug!(%candidate, "Existence check failed, trying copy anyway: {}", reason);
                None
            }
        };

        let store = self.store();
        let options = CopyOptions::with_timeout(settings.copy_timeout);
        let (copier, source, options) = (&self.copier, &source, &options);

        let staging = settings
            .retry
            .run("fetch", move |_| async move {
                let staging = store.staging_file()?;
                let mut sink = staging_writer(&staging)?;
                let result = copier.copy_to(source, &mut sink, expected_size, options).await;
                drop(sink);
                match result {
                    CopyResult::Success { .. } => Ok(staging),
                    CopyResult::FileNotFound => {
                        Err(MeshError::ContentNotFound(source.display().to_string()))
                    }
                    CopyResult::Timeout { .. } => {
                        Err(MeshError::Timeout(options.timeout.unwrap_or_default()))
                    }
                    CopyResult::Cancelled { .. } => Err(MeshError::Cancelled),
                    CopyResult::DestinationPathError { reason, .. } => {
                        Err(MeshError::io("writing staged copy", std::io::Error::other(reason)))
                    }
                    CopyResult::SourceReadError { reason, .. } => {
                        Err(MeshError::network(candidate, reason))
                    }
                }
            })
            .await;

        let staging = match staging {
            Ok(staging) => staging,
            Err(MeshError::ContentNotFound(_)) => {
                self.index().remove(hash, candidate);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let staged = store.seal(staging).await?;
        if staged.hash() != *hash {
            warn!(
                expected = %hash.short(),
                actual = %staged.hash().short(),
                %candidate,
                "Copied content does not match its hash"
            );
            return Ok(false);
        }
        store.commit(staged).await?;
        Ok(true)
    }

    /// Run a background loop; ending before `stop` fires is a node fault
    fn spawn(
        &self,
        name: &'static str,
        stop: ShutdownSignal,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let faults = self.faults.clone();
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(task).catch_unwind().await;
            if stop.is_triggered() {
                return;
            }
            let cause = match outcome {
                Ok(()) => format!("{} exited unexpectedly", name),
                Err(_) => format!("{} panicked", name),
            };
            error!(task = name, "Background task failed");
            faults.send_replace(Some(cause));
        });
        self.aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.abort_handle());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

#[async_trait]
impl NodeHost for CacheNode {
    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            remote_teardown: self.coordinator.settings.remote_teardown,
        }
    }

    async fn start(&self, shutdown: ShutdownSignal) -> MeshResult<()> {
        self.store().ensure_dirs().await?;
        self.registry.register(self.local.clone());

        let coordinator = &self.coordinator;
        coordinator.heartbeat().await;
        let role = coordinator.refresh_role().await;
        if role == Role::Worker {
            coordinator.restore().await;
        }
        info!(
            machine = %coordinator.machine,
            stamp = %coordinator.settings.stamp,
            %role,
            "Node started"
        );

        self.spawn(
            "heartbeat loop",
            shutdown.clone(),
            coordinator.clone().heartbeat_loop(shutdown.clone()),
        );
        self.spawn(
            "checkpoint creation loop",
            shutdown.clone(),
            coordinator.clone().create_loop(shutdown.clone()),
        );
        self.spawn(
            "checkpoint restore loop",
            shutdown.clone(),
            coordinator.clone().restore_loop(shutdown),
        );
        Ok(())
    }

    async fn fault(&self) -> MeshError {
        let mut faults = self.faults.subscribe();
        let cause = faults
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|cause| cause.clone());
        match cause {
            Some(cause) => MeshError::HostFault(cause),
            // The sender lives as long as the node
            None => std::future::pending().await,
        }
    }

    async fn stop(&self) -> MeshResult<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        Ok(())
    }

    fn dispose(&self) {
        for handle in self
            .aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.registry.unregister(self.machine());
        debug!(machine = %self.machine(), "Node disposed");
    }
}
