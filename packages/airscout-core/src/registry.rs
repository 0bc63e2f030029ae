//! Cross-cycle device state.
//!
//! [`DeviceRegistry`] is plain data with synchronous reconcile/patch methods.
//! [`SharedRegistry`] owns it behind one async mutex and publishes an
//! immutable [`RegistrySnapshot`] after every mutation, so readers never take
//! the lock and never observe a half-applied cycle.

use crate::device::{DeviceId, DeviceRecord, DeviceStatus, StatusOrigin};
use crate::snapshot::{RegistryDiff, RegistrySnapshot};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

/// Removed ids remembered for diffs.
const TOMBSTONE_CAPACITY: usize = 256;

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
struct Entry {
    record: DeviceRecord,
    misses: u32,
    first_seen_rev: u64,
    changed_rev: u64,
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub generation: u64,
    pub revision: u64,
    pub added: Vec<DeviceId>,
    pub updated: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
    /// Known devices absent this cycle but still within the miss threshold
    pub missing: Vec<DeviceId>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug)]
pub struct DeviceRegistry {
    entries: HashMap<DeviceId, Entry>,
    miss_threshold: u32,
    generation: u64,
    revision: u64,
    tombstones: VecDeque<(DeviceId, u64)>,
    /// Highest revision of a tombstone dropped from the window
    evicted_through: u64,
    /// Cursor for [`DeviceRegistry::take_diff`]
    observed_revision: u64,
}

impl DeviceRegistry {
    /// A device is removed once it has been missing for more than
    /// `miss_threshold` consecutive cycles. Thresholds below 1 are raised to 1.
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            entries: HashMap::new(),
            miss_threshold: miss_threshold.max(1),
            generation: 0,
            revision: 0,
            tombstones: VecDeque::new(),
            evicted_through: 0,
            observed_revision: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.entries.get(id).map(|e| &e.record)
    }

    pub fn misses(&self, id: &DeviceId) -> Option<u32> {
        self.entries.get(id).map(|e| e.misses)
    }

    /// Paint records restored from the warm-start cache.
    ///
    /// Only applies to an empty registry; returns how many were inserted.
    pub fn seed(&mut self, records: Vec<DeviceRecord>) -> usize {
        if !self.entries.is_empty() || records.is_empty() {
            return 0;
        }

        let rev = self.revision + 1;
        for mut record in records {
            record.status_origin = StatusOrigin::Cached;
            self.entries.insert(
                record.id.clone(),
                Entry {
                    record,
                    misses: 0,
                    first_seen_rev: rev,
                    changed_rev: rev,
                },
            );
        }
        self.revision = rev;
        self.entries.len()
    }

    /// Fold one cycle's deduplicated records into the registry.
    ///
    /// `stale_sources` names probes that failed this cycle: an absent device
    /// reported only by those probes keeps its miss counter unchanged.
    pub fn reconcile(&mut self, devices: Vec<DeviceRecord>, stale_sources: &HashSet<String>) -> ReconcileReport {
        self.generation += 1;
        let rev = self.revision + 1;
        let mut report = ReconcileReport {
            generation: self.generation,
            ..ReconcileReport::default()
        };

        let mut seen: HashSet<DeviceId> = HashSet::with_capacity(devices.len());
        for incoming in devices {
            let id = incoming.id.clone();
            if !seen.insert(id.clone()) {
                tracing::warn!("Duplicate device {} in one cycle, keeping the first", id);
                continue;
            }

            match self.entries.get_mut(&id) {
                Some(entry) => {
                    let merged = merge_incoming(&entry.record, incoming);
                    if !entry.record.same_state(&merged) {
                        entry.changed_rev = rev;
                        report.updated.push(id);
                    }
                    entry.record = merged;
                    entry.misses = 0;
                }
                None => {
                    self.entries.insert(
                        id.clone(),
                        Entry {
                            record: incoming,
                            misses: 0,
                            first_seen_rev: rev,
                            changed_rev: rev,
                        },
                    );
                    report.added.push(id);
                }
            }
        }

        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if seen.contains(id) {
                continue;
            }
            let held = !entry.record.sources.is_empty()
                && entry.record.sources.iter().all(|s| stale_sources.contains(s));
            if held {
                tracing::debug!("Holding {} while its probes are failing", id);
                report.missing.push(id.clone());
                continue;
            }
            // Cached entries only paint the view until a live cycle covers them
            if entry.record.status_origin == StatusOrigin::Cached {
                expired.push(id.clone());
                continue;
            }
            entry.misses += 1;
            if entry.misses > self.miss_threshold {
                expired.push(id.clone());
            } else {
                report.missing.push(id.clone());
            }
        }

        for id in expired {
            self.entries.remove(&id);
            self.push_tombstone(id.clone(), rev);
            report.removed.push(id);
        }

        if report.changed() {
            self.revision = rev;
        }
        report.revision = self.revision;
        report.added.sort();
        report.updated.sort();
        report.removed.sort();
        report.missing.sort();

        tracing::debug!(
            "Reconciled generation {}: +{} ~{} -{} ({} missing)",
            report.generation,
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.missing.len()
        );

        report
    }

    /// Record the status a successful management action produced.
    ///
    /// Returns `false` if the device is no longer registered.
    pub fn patch_status(&mut self, id: &DeviceId, status: DeviceStatus) -> bool {
        let rev = self.revision + 1;
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.record.status == status && entry.record.status_origin == StatusOrigin::Optimistic {
            return true;
        }
        entry.record.status = status;
        entry.record.status_origin = StatusOrigin::Optimistic;
        entry.changed_rev = rev;
        self.revision = rev;
        true
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(
            self.generation,
            self.revision,
            self.entries.values().map(|e| e.record.clone()).collect(),
        )
    }

    /// Changes after `revision` up to the current revision.
    pub fn diff_since(&self, revision: u64) -> RegistryDiff {
        let mut diff = RegistryDiff {
            from_revision: revision,
            to_revision: self.revision,
            truncated: revision < self.evicted_through,
            ..RegistryDiff::default()
        };

        for (id, entry) in &self.entries {
            if entry.first_seen_rev > revision {
                diff.added.push(id.clone());
            } else if entry.changed_rev > revision {
                diff.updated.push(id.clone());
            }
        }

        for (id, rev) in &self.tombstones {
            if *rev > revision && !self.entries.contains_key(id) && !diff.removed.contains(id) {
                diff.removed.push(id.clone());
            }
        }

        diff.added.sort();
        diff.updated.sort();
        diff.removed.sort();
        diff
    }

    /// Diff since the previous call, advancing the observation cursor.
    pub fn take_diff(&mut self) -> RegistryDiff {
        let diff = self.diff_since(self.observed_revision);
        self.observed_revision = self.revision;
        diff
    }

    fn push_tombstone(&mut self, id: DeviceId, rev: u64) {
        self.tombstones.push_back((id, rev));
        while self.tombstones.len() > TOMBSTONE_CAPACITY {
            if let Some((_, evicted)) = self.tombstones.pop_front() {
                self.evicted_through = self.evicted_through.max(evicted);
            }
        }
    }
}

/// Probed fields replace the previous record; optional fields the cycle did
/// not report keep their previous values.
fn merge_incoming(previous: &DeviceRecord, incoming: DeviceRecord) -> DeviceRecord {
    let mut merged = incoming;
    merged.status_origin = StatusOrigin::Probed;
    if merged.vendor_id.is_none() {
        merged.vendor_id = previous.vendor_id.clone();
    }
    if merged.product_id.is_none() {
        merged.product_id = previous.product_id.clone();
    }
    if merged.vendor_name.is_none() {
        merged.vendor_name = previous.vendor_name.clone();
    }
    if merged.address.is_none() {
        merged.address = previous.address.clone();
    }
    if merged.battery_level.is_none() {
        merged.battery_level = previous.battery_level;
    }
    merged
}

/// Change notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Added { device: DeviceRecord },
    Updated { device: DeviceRecord },
    Removed { id: DeviceId },
    CycleCompleted { generation: u64, revision: u64 },
}

/// The registry shared between the scan loop, management and readers.
pub struct SharedRegistry {
    inner: Mutex<DeviceRegistry>,
    snapshot_tx: watch::Sender<Arc<RegistrySnapshot>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SharedRegistry {
    pub fn new(registry: DeviceRegistry) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(registry.snapshot()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(registry),
            snapshot_tx,
            events,
        }
    }

    /// Latest published snapshot. Never waits on a running mutation.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.snapshot().get(id).cloned()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn seed(&self, records: Vec<DeviceRecord>) -> usize {
        let mut registry = self.inner.lock().await;
        let inserted = registry.seed(records);
        if inserted > 0 {
            self.publish(&registry);
        }
        inserted
    }

    pub async fn reconcile(&self, devices: Vec<DeviceRecord>, stale_sources: &HashSet<String>) -> ReconcileReport {
        let mut registry = self.inner.lock().await;
        let report = registry.reconcile(devices, stale_sources);
        let snapshot = self.publish(&registry);
        drop(registry);

        for id in &report.added {
            if let Some(device) = snapshot.get(id) {
                let _ = self.events.send(RegistryEvent::Added { device: device.clone() });
            }
        }
        for id in &report.updated {
            if let Some(device) = snapshot.get(id) {
                let _ = self.events.send(RegistryEvent::Updated { device: device.clone() });
            }
        }
        for id in &report.removed {
            let _ = self.events.send(RegistryEvent::Removed { id: id.clone() });
        }
        let _ = self.events.send(RegistryEvent::CycleCompleted {
            generation: report.generation,
            revision: report.revision,
        });

        report
    }

    pub async fn patch_status(&self, id: &DeviceId, status: DeviceStatus) -> bool {
        let mut registry = self.inner.lock().await;
        let before = registry.revision();
        if !registry.patch_status(id, status) {
            return false;
        }
        if registry.revision() != before {
            let snapshot = self.publish(&registry);
            drop(registry);
            if let Some(device) = snapshot.get(id) {
                let _ = self.events.send(RegistryEvent::Updated { device: device.clone() });
            }
        }
        true
    }

    pub async fn diff_since(&self, revision: u64) -> RegistryDiff {
        self.inner.lock().await.diff_since(revision)
    }

    pub async fn take_diff(&self) -> RegistryDiff {
        self.inner.lock().await.take_diff()
    }

    fn publish(&self, registry: &DeviceRegistry) -> Arc<RegistrySnapshot> {
        let snapshot = Arc::new(registry.snapshot());
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}

impl std::fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("SharedRegistry")
            .field("revision", &snapshot.revision)
            .field("devices", &snapshot.len())
            .finish()
    }
}
