//! In-memory content location index
//!
//! Maps each content hash to the machines holding it, with the time each
//! location was last observed. Reads may run concurrently; mutations take
//! the write lock. An entry whose location set becomes empty is dropped.

use crate::location::hash::{ContentHash, MachineLocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

type LocationMap = BTreeMap<MachineLocation, DateTime<Utc>>;

/// A single `(machine, lastSeen)` pair for a hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub machine: MachineLocation,
    pub last_seen: DateTime<Utc>,
}

/// Serialized form of one index row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: ContentHash,
    pub locations: Vec<LocationEntry>,
}

/// Full serialized index state, as carried inside a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub entries: Vec<IndexEntry>,
}

impl IndexState {
    /// Number of `(hash, machine)` pairs in the state
    pub fn location_count(&self) -> usize {
        self.entries.iter().map(|e| e.locations.len()).sum()
    }
}

/// Counters reported by a merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Locations not previously known locally
    pub added: usize,
    /// Locations whose lastSeen moved forward
    pub refreshed: usize,
    /// Locations where the local entry was newer and kept
    pub kept_local: usize,
}

/// Content hash to machine-set mapping
#[derive(Debug, Default)]
pub struct ContentLocationIndex {
    entries: RwLock<BTreeMap<ContentHash, LocationMap>>,
}

impl ContentLocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ContentHash, LocationMap>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ContentHash, LocationMap>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `machine` holds `hash`, observed now
    pub fn record(&self, hash: ContentHash, machine: MachineLocation) {
        self.record_at(hash, machine, Utc::now());
    }

    /// Record an observation with an explicit timestamp
    ///
    /// An older observation never moves `lastSeen` backwards.
    pub fn record_at(&self, hash: ContentHash, machine: MachineLocation, seen: DateTime<Utc>) {
        let mut entries = self.write();
        let locations = entries.entry(hash).or_default();
        let last_seen = locations.entry(machine).or_insert(seen);
        if seen > *last_seen {
            *last_seen = seen;
        }
    }

    /// Remove one location for a hash, returning whether it was present
    pub fn remove(&self, hash: &ContentHash, machine: &MachineLocation) -> bool {
        let mut entries = self.write();
        let Some(locations) = entries.get_mut(hash) else {
            return false;
        };
        let removed = locations.remove(machine).is_some();
        if locations.is_empty() {
            entries.remove(hash);
        }
        removed
    }

    /// Machines currently holding `hash`
    pub fn lookup(&self, hash: &ContentHash) -> BTreeSet<MachineLocation> {
        self.read()
            .get(hash)
            .map(|locations| locations.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Locations for `hash`, most recently seen first
    pub fn lookup_entries(&self, hash: &ContentHash) -> Vec<LocationEntry> {
        let mut found: Vec<LocationEntry> = self
            .read()
            .get(hash)
            .map(|locations| {
                locations
                    .iter()
                    .map(|(machine, last_seen)| LocationEntry {
                        machine: machine.clone(),
                        last_seen: *last_seen,
                    })
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        found
    }

    /// Number of distinct hashes
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every location not seen since `cutoff`; returns how many were removed
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.write();
        let mut evicted = 0;
        entries.retain(|_, locations| {
            let before = locations.len();
            locations.retain(|_, last_seen| *last_seen >= cutoff);
            evicted += before - locations.len();
            !locations.is_empty()
        });
        if evicted > 0 {
            debug!(evicted, %cutoff, "Evicted stale locations");
        }
        evicted
    }

    /// Hash to machine-set view, for comparisons and diagnostics
    pub fn mapping(&self) -> BTreeMap<ContentHash, BTreeSet<MachineLocation>> {
        self.read()
            .iter()
            .map(|(hash, locations)| (*hash, locations.keys().cloned().collect()))
            .collect()
    }

    /// Serialize the full current state
    pub fn snapshot(&self) -> IndexState {
        let entries = self
            .read()
            .iter()
            .map(|(hash, locations)| IndexEntry {
                hash: *hash,
                locations: locations
                    .iter()
                    .map(|(machine, last_seen)| LocationEntry {
                        machine: machine.clone(),
                        last_seen: *last_seen,
                    })
                    .collect(),
            })
            .collect();
        IndexState { entries }
    }

    /// Merge a serialized state into this index
    ///
    /// Per `(hash, machine)` the later `lastSeen` wins; on a tie the local
    /// entry is kept. Locations only known locally are never dropped.
    pub fn merge(&self, state: &IndexState) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut entries = self.write();

        for entry in &state.entries {
            if entry.locations.is_empty() {
                continue;
            }
            let locations = entries.entry(entry.hash).or_default();
            for incoming in &entry.locations {
                match locations.get_mut(&incoming.machine) {
                    None => {
                        locations.insert(incoming.machine.clone(), incoming.last_seen);
                        stats.added += 1;
                    }
                    Some(local) if incoming.last_seen > *local => {
                        *local = incoming.last_seen;
                        stats.refreshed += 1;
                    }
                    Some(_) => stats.kept_local += 1,
                }
            }
        }

        stats
    }
}
