//! Warm-start device cache.
//!
//! Holds the last known device list so a fresh process can paint something
//! before its first cycle completes. Never authoritative: the registry marks
//! cached entries and the first live cycle replaces them.

use crate::device::{DeviceId, DeviceRecord};
use crate::snapshot::RegistrySnapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CACHE_FILE: &str = "device_cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub id: DeviceId,
    pub record: DeviceRecord,
}

/// On-disk cache document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCache {
    pub saved_at: DateTime<Utc>,
    pub devices: Vec<CacheEntry>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<local data dir>/airscout/device_cache.json`
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .context("Could not find data directory")?;
        Ok(Self::new(data_dir.join("airscout").join(CACHE_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load cached records in their saved order. A missing file is an empty
    /// cache; an unreadable or corrupt one is an error.
    pub fn load(&self) -> Result<Vec<DeviceRecord>> {
        if !self.path.exists() {
            tracing::debug!("No device cache at {:?}", self.path);
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path).context("Failed to read device cache")?;
        let cache: DeviceCache = serde_json::from_str(&content).context("Failed to parse device cache")?;

        let total = cache.devices.len();
        let records: Vec<DeviceRecord> = cache
            .devices
            .into_iter()
            .filter(|entry| {
                let consistent = entry.id == entry.record.id;
                if !consistent {
                    tracing::warn!("Dropping cache entry {} with mismatched record id", entry.id);
                }
                consistent
            })
            .map(|entry| entry.record)
            .collect();

        tracing::info!(
            "Loaded {} of {} cached devices saved at {}",
            records.len(),
            total,
            cache.saved_at.to_rfc3339()
        );
        Ok(records)
    }

    /// Persist a snapshot, dropping raw diagnostic payloads.
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let cache = DeviceCache {
            saved_at: Utc::now(),
            devices: snapshot
                .devices
                .iter()
                .map(|device| {
                    let mut record = device.clone();
                    record.raw.clear();
                    CacheEntry {
                        id: record.id.clone(),
                        record,
                    }
                })
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
        }

        let content = serde_json::to_string_pretty(&cache).context("Failed to serialize device cache")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).context("Failed to write device cache")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace device cache")?;

        tracing::debug!("Saved {} devices to cache", cache.devices.len());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to delete device cache")?;
            tracing::info!("Cleared device cache");
        }
        Ok(())
    }
}
