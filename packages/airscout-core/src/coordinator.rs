//! Owns the registry and drives scan cycles.
//!
//! Presentation code talks to a [`Coordinator`]: trigger or await a scan,
//! read snapshots and diffs, subscribe to events, issue management requests
//! and pull host statistics.

use crate::cache::CacheStore;
use crate::config::AgentConfig;
use crate::device::{DeviceCategory, DeviceId, DeviceRecord};
use crate::manager::{ManagementAction, ManagementExecutor, ManagementResult};
use crate::monitor::{HostMonitor, SystemMonitor, SystemStats};
use crate::pipeline::{CycleReport, DetectionPipeline};
use crate::probe::ProbeTable;
use crate::registry::{DeviceRegistry, ReconcileReport, RegistryEvent, SharedRegistry};
use crate::snapshot::{DeviceFilter, RegistryDiff, RegistrySnapshot};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Result of one completed scan cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub report: CycleReport,
    pub changes: ReconcileReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    pub name: String,
    pub priority: u8,
    pub categories: Vec<DeviceCategory>,
    pub available: bool,
}

pub struct Coordinator {
    config: AgentConfig,
    probes: Arc<ProbeTable>,
    pipeline: DetectionPipeline,
    registry: Arc<SharedRegistry>,
    executor: ManagementExecutor,
    monitor: Arc<dyn SystemMonitor>,
    cache: Option<CacheStore>,
    /// Held for the duration of a cycle; contenders wait and share the result
    scan_gate: Mutex<()>,
    last_cycle: std::sync::Mutex<Option<CycleSummary>>,
    trigger: Notify,
}

impl Coordinator {
    pub fn new(
        config: AgentConfig,
        probes: ProbeTable,
        monitor: Arc<dyn SystemMonitor>,
        cache: Option<CacheStore>,
    ) -> Self {
        let probes = Arc::new(probes);
        let registry = Arc::new(SharedRegistry::new(DeviceRegistry::new(config.miss_threshold)));
        let pipeline = DetectionPipeline::new(probes.clone(), config.probe_timeout());
        let executor = ManagementExecutor::new(registry.clone(), probes.clone(), config.command_timeout());

        Self {
            config,
            probes,
            pipeline,
            registry,
            executor,
            monitor,
            cache,
            scan_gate: Mutex::new(()),
            last_cycle: std::sync::Mutex::new(None),
            trigger: Notify::new(),
        }
    }

    /// Platform probes, the host monitor and, if enabled, the default cache.
    pub fn from_config(config: AgentConfig) -> Self {
        let probes = ProbeTable::platform_default(&config);
        let cache = if config.warm_start_cache {
            match CacheStore::default_location() {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::warn!("Warm-start cache disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, probes, Arc::new(HostMonitor::new()), cache)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn probes(&self) -> &Arc<ProbeTable> {
        &self.probes
    }

    /// Seed the registry from the warm-start cache. Errors are logged and
    /// the cache ignored.
    pub async fn warm_start(&self) -> usize {
        let Some(cache) = self.cache.clone() else {
            return 0;
        };

        let loaded = tokio::task::spawn_blocking(move || cache.load()).await;
        let records = match loaded {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::warn!("Ignoring device cache: {:#}", e);
                return 0;
            }
            Err(e) => {
                tracing::warn!("Device cache task failed: {}", e);
                return 0;
            }
        };

        let seeded = self.registry.seed(records).await;
        if seeded > 0 {
            tracing::info!("Warm start painted {} cached devices", seeded);
        }
        seeded
    }

    /// Run a cycle now, or wait for the one already running and share it.
    ///
    /// Returns `None` when cancelled.
    pub async fn scan_now(&self, cancel: &CancellationToken) -> Option<CycleSummary> {
        let seen = self.last_generation();
        let _gate = match self.scan_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                tracing::debug!("Scan already in flight, waiting for its result");
                let gate = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    gate = self.scan_gate.lock() => gate,
                };
                // The shared cycle may have been cancelled without completing
                let latest = self.last_cycle();
                if latest.as_ref().map(|s| s.changes.generation) != seen {
                    return latest;
                }
                tracing::debug!("Shared scan did not complete, running a fresh one");
                gate
            }
        };

        let output = self.pipeline.run_cycle(cancel).await?;
        let failed = output.report.failed_probes();
        let changes = self.registry.reconcile(output.devices, &failed).await;

        tracing::info!(
            "Scan cycle {}: {} devices (+{} ~{} -{})",
            changes.generation,
            output.report.devices,
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );

        if let Some(cache) = self.cache.clone() {
            let snapshot = self.registry.snapshot();
            match tokio::task::spawn_blocking(move || cache.save(&snapshot)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Failed to save device cache: {:#}", e),
                Err(e) => tracing::warn!("Device cache task failed: {}", e),
            }
        }

        let summary = CycleSummary {
            report: output.report,
            changes,
        };
        *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary.clone());
        Some(summary)
    }

    /// Wake the background loop for an immediate cycle.
    pub fn trigger_scan(&self) {
        self.trigger.notify_one();
    }

    /// Background polling loop. Returns when `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Background scanning every {}s with {} probes",
            self.config.scan_interval_secs,
            self.probes.len()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {
                    tracing::debug!("Scan triggered");
                }
            }

            if self.scan_now(&cancel).await.is_none() && cancel.is_cancelled() {
                break;
            }
        }

        tracing::info!("Background scanning stopped");
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn last_generation(&self) -> Option<u64> {
        self.last_cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.changes.generation)
    }

    pub async fn request(&self, id: &DeviceId, action: ManagementAction) -> ManagementResult {
        self.executor.request(id, action).await
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    /// Snapshot devices matching `filter`, in display order.
    pub fn view(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.snapshot().filter(filter).cloned().collect()
    }

    pub async fn diff_since(&self, revision: u64) -> RegistryDiff {
        self.registry.diff_since(revision).await
    }

    pub async fn take_diff(&self) -> RegistryDiff {
        self.registry.take_diff().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.registry.subscribe_snapshots()
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let monitor = self.monitor.clone();
        tokio::task::spawn_blocking(move || monitor.collect())
            .await
            .context("System monitor task failed")
    }

    /// Registered probes and whether their mechanism is present.
    pub async fn probe_status(&self) -> Vec<ProbeStatus> {
        let probes = self.probes.clone();
        let result = tokio::task::spawn_blocking(move || {
            probes
                .iter()
                .map(|p| ProbeStatus {
                    name: p.name().to_string(),
                    priority: p.priority(),
                    categories: p.descriptor().categories.clone(),
                    available: p.availability(),
                })
                .collect::<Vec<_>>()
        })
        .await;

        match result {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Probe availability check failed: {}", e);
                Vec::new()
            }
        }
    }
}
