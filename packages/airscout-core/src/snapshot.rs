//! Immutable registry views handed to readers.

use crate::device::{DeviceCategory, DeviceId, DeviceRecord, DeviceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Point-in-time copy of the registry, ordered by category, then display
/// name (case-insensitive), then id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Completed scan cycles
    pub generation: u64,
    pub revision: u64,
    pub taken_at: DateTime<Utc>,
    pub devices: Vec<DeviceRecord>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            revision: 0,
            taken_at: Utc::now(),
            devices: Vec::new(),
        }
    }

    pub(crate) fn new(generation: u64, revision: u64, mut devices: Vec<DeviceRecord>) -> Self {
        devices.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        Self {
            generation,
            revision,
            taken_at: Utc::now(),
            devices,
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices matching `filter`, in snapshot order.
    pub fn filter<'a>(&'a self, filter: &'a DeviceFilter) -> impl Iterator<Item = &'a DeviceRecord> + 'a {
        self.devices.iter().filter(move |d| filter.matches(d))
    }

    /// Compare device state only, ignoring timestamps and diagnostics.
    pub fn same_state(&self, other: &RegistrySnapshot) -> bool {
        self.devices.len() == other.devices.len()
            && self
                .devices
                .iter()
                .zip(other.devices.iter())
                .all(|(a, b)| a.same_state(b))
    }

    pub fn statistics(&self) -> DeviceStatistics {
        DeviceStatistics::from_devices(&self.devices)
    }
}

/// Display filter applied to snapshot views. Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub categories: BTreeSet<DeviceCategory>,
    pub statuses: BTreeSet<DeviceStatus>,
    pub manageable_only: bool,
}

impl DeviceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: DeviceCategory) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn status(mut self, status: DeviceStatus) -> Self {
        self.statuses.insert(status);
        self
    }

    pub fn manageable(mut self) -> Self {
        self.manageable_only = true;
        self
    }

    pub fn matches(&self, device: &DeviceRecord) -> bool {
        (self.categories.is_empty() || self.categories.contains(&device.category))
            && (self.statuses.is_empty() || self.statuses.contains(&device.status))
            && (!self.manageable_only || device.is_manageable())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatistics {
    pub total: usize,
    pub by_category: BTreeMap<DeviceCategory, usize>,
    pub by_status: BTreeMap<DeviceStatus, usize>,
    pub manageable: usize,
}

impl DeviceStatistics {
    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a DeviceRecord>) -> Self {
        let mut stats = DeviceStatistics::default();
        for device in devices {
            stats.total += 1;
            *stats.by_category.entry(device.category).or_insert(0) += 1;
            *stats.by_status.entry(device.status).or_insert(0) += 1;
            if device.is_manageable() {
                stats.manageable += 1;
            }
        }
        stats
    }
}

/// Ids that changed between two registry revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDiff {
    pub from_revision: u64,
    pub to_revision: u64,
    pub added: Vec<DeviceId>,
    pub updated: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
    /// Removals older than the tombstone window may be missing.
    pub truncated: bool,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}
