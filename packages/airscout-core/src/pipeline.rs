//! One detection cycle: run every applicable probe, normalize, deduplicate.

use crate::device::{DeviceCategory, DeviceId, DeviceRecord};
use crate::error::ProbeError;
use crate::oui;
use crate::probe::{PlatformProbe, ProbeTable, RawRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// What happened to one probe during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Unavailable { reason: String },
    Listed { records: usize, normalized: usize },
    Failed { message: String },
    TimedOut { timeout_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub probe: String,
    pub priority: u8,
    pub outcome: ProbeOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub probes: Vec<ProbeReport>,
    pub normalization_errors: usize,
    pub devices: usize,
}

impl CycleReport {
    /// Probes that were present but produced no trustworthy listing.
    pub fn failed_probes(&self) -> HashSet<String> {
        self.probes
            .iter()
            .filter(|r| matches!(r.outcome, ProbeOutcome::Failed { .. } | ProbeOutcome::TimedOut { .. }))
            .map(|r| r.probe.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutput {
    pub devices: Vec<DeviceRecord>,
    pub report: CycleReport,
}

/// A normalized record with the priority of the probe that produced it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub priority: u8,
    pub record: DeviceRecord,
}

struct Listing {
    records: Vec<RawRecord>,
    observed_at: DateTime<Utc>,
}

pub struct DetectionPipeline {
    probes: Arc<ProbeTable>,
    probe_timeout: Duration,
    /// Probes whose blocking call has not returned yet, timed out or not
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
}

impl DetectionPipeline {
    pub fn new(probes: Arc<ProbeTable>, probe_timeout: Duration) -> Self {
        Self {
            probes,
            probe_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn probes(&self) -> &Arc<ProbeTable> {
        &self.probes
    }

    /// Run one cycle. Returns `None` if cancelled before all probes finished;
    /// probe calls still running are detached and their results dropped.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Option<ScanOutput> {
        let started_at = Utc::now();
        let start = Instant::now();
        let selected = self.probes.for_cycle();

        tracing::debug!("Starting detection cycle with {} probes", selected.len());

        let futures = selected.iter().map(|probe| {
            let probe = probe.clone();
            let budget = self.probe_timeout;
            let in_flight = self.in_flight.clone();
            async move {
                let probe_start = Instant::now();
                let result = invoke(probe.clone(), budget, &in_flight).await;
                (probe, result, probe_start.elapsed())
            }
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Detection cycle cancelled");
                return None;
            }
            results = futures::future::join_all(futures) => results,
        };

        let mut candidates = Vec::new();
        let mut reports = Vec::with_capacity(results.len());
        let mut normalization_errors = 0;

        for (probe, result, elapsed) in results {
            let outcome = match result {
                Ok(listing) => {
                    let total = listing.records.len();
                    let mut normalized = 0;
                    for raw in listing.records {
                        match normalize(probe.as_ref(), raw, listing.observed_at) {
                            Ok(record) => {
                                normalized += 1;
                                candidates.push(Candidate {
                                    priority: probe.priority(),
                                    record,
                                });
                            }
                            Err(e) => {
                                normalization_errors += 1;
                                tracing::warn!("Skipping record: {}", e);
                            }
                        }
                    }
                    tracing::debug!("Probe {} listed {} records ({} normalized)", probe.name(), total, normalized);
                    ProbeOutcome::Listed {
                        records: total,
                        normalized,
                    }
                }
                Err(ProbeError::Unavailable { reason, .. }) => {
                    tracing::debug!("Probe {} unavailable: {}", probe.name(), reason);
                    ProbeOutcome::Unavailable { reason }
                }
                Err(ProbeError::Timeout { timeout_ms, .. }) => {
                    tracing::warn!("Probe {} timed out after {}ms", probe.name(), timeout_ms);
                    ProbeOutcome::TimedOut { timeout_ms }
                }
                Err(ProbeError::Execution { message, .. }) => {
                    tracing::warn!("Probe {} failed: {}", probe.name(), message);
                    ProbeOutcome::Failed { message }
                }
            };
            reports.push(ProbeReport {
                probe: probe.name().to_string(),
                priority: probe.priority(),
                outcome,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        let mut devices = merge_records(candidates);
        enrich_with_vendor(&mut devices);

        let report = CycleReport {
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
            probes: reports,
            normalization_errors,
            devices: devices.len(),
        };

        tracing::info!(
            "Detection cycle found {} devices in {}ms ({} probes, {} malformed records)",
            report.devices,
            report.elapsed_ms,
            report.probes.len(),
            report.normalization_errors
        );

        Some(ScanOutput { devices, report })
    }
}

/// Marks a probe busy until its blocking call returns.
struct ProbeLease {
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
    name: &'static str,
}

impl ProbeLease {
    fn acquire(in_flight: &Arc<Mutex<HashSet<&'static str>>>, name: &'static str) -> Option<Self> {
        let mut running = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(name) {
            return None;
        }
        Some(Self {
            in_flight: in_flight.clone(),
            name,
        })
    }
}

impl Drop for ProbeLease {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(self.name);
    }
}

/// Availability check and listing on the blocking pool, under `budget`.
///
/// A probe whose previous call is still blocked (it outlived its timeout) is
/// not started again; at most one blocking task per probe exists.
async fn invoke(
    probe: Arc<dyn PlatformProbe>,
    budget: Duration,
    in_flight: &Arc<Mutex<HashSet<&'static str>>>,
) -> Result<Listing, ProbeError> {
    let name = probe.name();
    let Some(lease) = ProbeLease::acquire(in_flight, name) else {
        return Err(ProbeError::execution(name, "previous call is still running"));
    };
    let task = spawn_blocking(move || {
        let _lease = lease;
        if !probe.availability() {
            return Err(ProbeError::unavailable(probe.name(), "mechanism not present on this host"));
        }
        let records = probe.list()?;
        Ok(Listing {
            records,
            observed_at: Utc::now(),
        })
    });

    match timeout(budget, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ProbeError::execution(name, format!("probe task failed: {}", join_error))),
        Err(_) => Err(ProbeError::timeout(name, budget.as_millis() as u64)),
    }
}

fn normalize(
    probe: &dyn PlatformProbe,
    raw: RawRecord,
    observed_at: DateTime<Utc>,
) -> Result<DeviceRecord, crate::error::NormalizationError> {
    let draft = probe.normalize(&raw)?;
    draft.into_record(probe.name(), raw.fields, observed_at)
}

/// Collapse candidates that denote the same physical device.
///
/// Records group by id (normalized address, or vendor/product id plus name
/// when no address is known). Within a group the highest priority wins, ties
/// going to the most recent observation. An address-less group that matches
/// exactly one addressed group on vendor id, product id and name joins it.
pub fn merge_records(mut candidates: Vec<Candidate>) -> Vec<DeviceRecord> {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.record.last_seen.cmp(&a.record.last_seen))
    });

    let mut order: Vec<DeviceId> = Vec::new();
    let mut groups: HashMap<DeviceId, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        let id = candidate.record.id.clone();
        groups
            .entry(id.clone())
            .or_insert_with(|| {
                order.push(id);
                Vec::new()
            })
            .push(candidate);
    }

    // Fold address-less groups into their unique addressed counterpart
    let addressless: Vec<DeviceId> = order
        .iter()
        .filter(|id| groups.get(*id).is_some_and(|g| g[0].record.address.is_none()))
        .cloned()
        .collect();
    for id in addressless {
        let Some(key) = groups.get(&id).map(|g| identity_key(&g[0].record)) else {
            continue;
        };
        let targets: Vec<&DeviceId> = order
            .iter()
            .filter(|other| {
                groups
                    .get(*other)
                    .is_some_and(|g| g[0].record.address.is_some() && identity_key(&g[0].record) == key)
            })
            .collect();
        if targets.len() != 1 {
            continue;
        }
        let target = targets[0].clone();
        if let Some(moved) = groups.remove(&id) {
            tracing::debug!("Merging {} into {}", id, target);
            if let Some(group) = groups.get_mut(&target) {
                group.extend(moved);
                group.sort_by(|a, b| {
                    let a_addressed = a.record.id == target;
                    let b_addressed = b.record.id == target;
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| b_addressed.cmp(&a_addressed))
                        .then_with(|| b.record.last_seen.cmp(&a.record.last_seen))
                });
            }
        }
    }

    let mut merged: Vec<DeviceRecord> = order
        .iter()
        .filter_map(|id| groups.remove(id).and_then(|group| merge_group(id, group)))
        .collect();
    merged.sort_by(|a, b| a.id.cmp(&b.id));
    merged
}

fn identity_key(record: &DeviceRecord) -> (Option<String>, Option<String>, String) {
    (
        record.vendor_id.clone(),
        record.product_id.clone(),
        record.name.clone(),
    )
}

/// Merge one sorted group into a single record carrying `id`.
fn merge_group(id: &DeviceId, group: Vec<Candidate>) -> Option<DeviceRecord> {
    let manager = group
        .iter()
        .find(|c| !c.record.capabilities.is_info_only())
        .map(|c| (c.record.capabilities.clone(), c.record.backend.clone()));
    let addressed = group
        .iter()
        .find(|c| &c.record.id == id)
        .map(|c| c.record.address.clone());

    let mut iter = group.into_iter();
    let mut winner = iter.next()?.record;

    for candidate in iter {
        let other = candidate.record;
        if winner.category == DeviceCategory::Other {
            winner.category = other.category;
        }
        if winner.vendor_id.is_none() {
            winner.vendor_id = other.vendor_id;
        }
        if winner.product_id.is_none() {
            winner.product_id = other.product_id;
        }
        if winner.vendor_name.is_none() {
            winner.vendor_name = other.vendor_name;
        }
        if winner.signal_strength.is_none() {
            winner.signal_strength = other.signal_strength;
        }
        if winner.battery_level.is_none() {
            winner.battery_level = other.battery_level;
        }
        if other.last_seen > winner.last_seen {
            winner.last_seen = other.last_seen;
        }
        for source in other.sources {
            if !winner.sources.contains(&source) {
                winner.sources.push(source);
            }
        }
        for (probe, payload) in other.raw {
            winner.raw.entry(probe).or_insert(payload);
        }
    }

    if let Some((capabilities, backend)) = manager {
        winner.capabilities = capabilities;
        winner.backend = backend;
    }
    winner.id = id.clone();
    if let Some(address) = addressed {
        winner.address = address;
    }
    Some(winner)
}

/// Fill vendor names from the OUI registry for MAC-addressed devices.
fn enrich_with_vendor(devices: &mut [DeviceRecord]) {
    for device in devices.iter_mut() {
        if device.vendor_name.is_some() {
            continue;
        }
        let Some(mac) = device.mac_address().map(str::to_string) else {
            continue;
        };
        if let Some(vendor) = oui::lookup_vendor(&mac) {
            if device.category == DeviceCategory::Other {
                if let Some(category) = oui::infer_category(&vendor) {
                    device.category = category;
                }
            }
            device.vendor_name = Some(vendor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CapabilitySet, DeviceDraft, DeviceStatus, RawFields};
    use crate::testing::{raw, FakeProbe};
    use chrono::TimeZone;

    fn table(probes: Vec<Arc<FakeProbe>>) -> Arc<ProbeTable> {
        Arc::new(ProbeTable::new(
            probes.into_iter().map(|p| p as Arc<dyn PlatformProbe>).collect(),
        ))
    }

    fn pipeline(probes: Vec<Arc<FakeProbe>>, budget: Duration) -> DetectionPipeline {
        DetectionPipeline::new(table(probes), budget)
    }

    #[tokio::test]
    async fn test_same_address_from_two_probes_merges() {
        let a = Arc::new(
            FakeProbe::new("bluetooth", 70, &[DeviceCategory::WirelessAudio]).with_records(vec![raw(&[
                ("address", "AA:BB"),
                ("name", "HeadsetX"),
                ("category", "wireless_audio"),
            ])]),
        );
        let b = Arc::new(
            FakeProbe::new("usb", 40, &[DeviceCategory::UsbWireless]).with_records(vec![raw(&[
                ("address", "aa-bb"),
                ("name", "USB Audio"),
                ("category", "usb_wireless"),
                ("vendor_id", "0b05"),
            ])]),
        );

        let output = pipeline(vec![a, b], Duration::from_secs(5))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.devices.len(), 1);
        let device = &output.devices[0];
        assert_eq!(device.address.as_deref(), Some("AA:BB"));
        assert_eq!(device.name, "HeadsetX");
        assert_eq!(device.category, DeviceCategory::WirelessAudio);
        assert_eq!(device.vendor_id.as_deref(), Some("0b05"));
        assert_eq!(device.sources, vec!["bluetooth".to_string(), "usb".to_string()]);
        assert_eq!(device.raw.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_probe_is_silent() {
        let missing = Arc::new(
            FakeProbe::new("rfkill", 80, &[DeviceCategory::Bluetooth])
                .unavailable()
                .with_records(vec![raw(&[("address", "11:22"), ("name", "ghost")])]),
        );
        let present = Arc::new(
            FakeProbe::new("network", 90, &[DeviceCategory::WifiAdapter])
                .with_records(vec![raw(&[("address", "wlan0"), ("name", "wlan0")])]),
        );

        let output = pipeline(vec![missing.clone(), present], Duration::from_secs(5))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.devices.len(), 1);
        assert_eq!(missing.list_calls(), 0);
        let rfkill = output.report.probes.iter().find(|r| r.probe == "rfkill").unwrap();
        assert!(matches!(rfkill.outcome, ProbeOutcome::Unavailable { .. }));
        assert!(output.report.failed_probes().is_empty());
    }

    #[tokio::test]
    async fn test_slow_probe_times_out_without_stalling_cycle() {
        let slow = Arc::new(
            FakeProbe::new("usb", 40, &[DeviceCategory::UsbWireless])
                .with_list_delay(Duration::from_millis(800))
                .with_records(vec![raw(&[("name", "Slow Receiver")])]),
        );
        let fast = Arc::new(
            FakeProbe::new("network", 90, &[DeviceCategory::WifiAdapter])
                .with_records(vec![raw(&[("address", "wlan0"), ("name", "wlan0")])]),
        );

        let start = Instant::now();
        let output = pipeline(vec![slow, fast], Duration::from_millis(100))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(700));

        assert_eq!(output.devices.len(), 1);
        let usb = output.report.probes.iter().find(|r| r.probe == "usb").unwrap();
        assert_eq!(usb.outcome, ProbeOutcome::TimedOut { timeout_ms: 100 });
        assert!(output.report.failed_probes().contains("usb"));
    }

    #[tokio::test]
    async fn test_hung_backend_is_not_relaunched() {
        let hung = Arc::new(
            FakeProbe::new("bluetooth", 70, &[DeviceCategory::Bluetooth])
                .with_list_delay(Duration::from_millis(400))
                .with_records(vec![raw(&[("address", "AA:BB:CC:DD:EE:01"), ("name", "Mouse")])]),
        );
        let pipeline = pipeline(vec![hung.clone()], Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let first = pipeline.run_cycle(&cancel).await.unwrap();
        assert_eq!(first.report.probes[0].outcome, ProbeOutcome::TimedOut { timeout_ms: 50 });

        for _ in 0..3 {
            let output = pipeline.run_cycle(&cancel).await.unwrap();
            assert!(matches!(
                &output.report.probes[0].outcome,
                ProbeOutcome::Failed { message } if message.contains("still running")
            ));
            assert!(output.report.failed_probes().contains("bluetooth"));
        }
        assert_eq!(hung.list_calls(), 1);

        // Once the stuck call returns the probe runs again
        tokio::time::sleep(Duration::from_millis(600)).await;
        pipeline.run_cycle(&cancel).await.unwrap();
        assert_eq!(hung.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let probe = Arc::new(FakeProbe::new("bluetooth", 70, &[DeviceCategory::Bluetooth]).with_records(vec![
            raw(&[("address", "AA:BB:CC:DD:EE:01"), ("name", "Mouse")]),
            raw(&[("malformed", "yes")]),
            raw(&[]),
        ]));

        let output = pipeline(vec![probe], Duration::from_secs(5))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.devices.len(), 1);
        assert_eq!(output.report.normalization_errors, 2);
        assert_eq!(
            output.report.probes[0].outcome,
            ProbeOutcome::Listed {
                records: 3,
                normalized: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failing_probe_is_reported() {
        let probe = Arc::new(FakeProbe::new("bluetooth", 70, &[DeviceCategory::Bluetooth]));
        probe.fail_with(Some(ProbeError::execution("bluetooth", "org.bluez.Error.NotReady")));

        let output = pipeline(vec![probe], Duration::from_secs(5))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert!(output.devices.is_empty());
        assert!(output.report.failed_probes().contains("bluetooth"));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_returns_none() {
        let slow = Arc::new(
            FakeProbe::new("usb", 40, &[DeviceCategory::UsbWireless]).with_list_delay(Duration::from_millis(300)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = pipeline(vec![slow], Duration::from_secs(5)).run_cycle(&cancel).await;
        assert!(output.is_none());
    }

    #[tokio::test]
    async fn test_management_capability_comes_from_managing_probe() {
        let usb = Arc::new(FakeProbe::new("usb", 90, &[DeviceCategory::WifiAdapter]).with_records(vec![raw(&[
            ("address", "wlan0"),
            ("name", "Realtek 802.11n"),
            ("category", "wifi"),
        ])]));
        let network = Arc::new(
            FakeProbe::new("network", 50, &[DeviceCategory::WifiAdapter]).with_records(vec![raw(&[
                ("address", "wlan0"),
                ("name", "Wireless Interface wlan0"),
                ("category", "wifi"),
                ("manage", "yes"),
            ])]),
        );

        let output = pipeline(vec![usb, network], Duration::from_secs(5))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        let device = &output.devices[0];
        assert_eq!(device.name, "Realtek 802.11n");
        assert_eq!(device.backend, "network");
        assert!(device.is_manageable());
    }

    fn candidate(priority: u8, draft: DeviceDraft, probe: &str, seconds: i64) -> Candidate {
        let observed = Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap();
        Candidate {
            priority,
            record: draft.into_record(probe, RawFields::new(), observed).unwrap(),
        }
    }

    #[test]
    fn test_equal_priority_prefers_newest_observation() {
        let older = candidate(
            50,
            DeviceDraft::new(DeviceCategory::Bluetooth, "Old Name").address("AA:BB:CC:DD:EE:FF"),
            "a",
            0,
        );
        let newer = candidate(
            50,
            DeviceDraft::new(DeviceCategory::Bluetooth, "New Name")
                .address("AA:BB:CC:DD:EE:FF")
                .status(DeviceStatus::Disabled),
            "b",
            10,
        );

        let merged = merge_records(vec![older, newer]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "New Name");
        assert_eq!(merged[0].status, DeviceStatus::Disabled);
    }

    #[test]
    fn test_addressless_record_joins_unique_addressed_match() {
        let usb = candidate(
            40,
            DeviceDraft::new(DeviceCategory::RfDongle, "Unifying Receiver")
                .ids(Some("046d".to_string()), Some("c52b".to_string()))
                .vendor_name("Logitech"),
            "usb",
            0,
        );
        let addressed = candidate(
            70,
            DeviceDraft::new(DeviceCategory::RfDongle, "Unifying Receiver")
                .ids(Some("046d".to_string()), Some("c52b".to_string()))
                .address("F0:18:98:00:00:01")
                .capabilities(CapabilitySet::toggle()),
            "bluetooth",
            0,
        );
        let unrelated = candidate(
            40,
            DeviceDraft::new(DeviceCategory::UsbWireless, "Other Dongle").ids(Some("0bda".to_string()), None),
            "usb",
            0,
        );

        let merged = merge_records(vec![usb, addressed, unrelated]);
        assert_eq!(merged.len(), 2);
        let receiver = merged.iter().find(|d| d.name == "Unifying Receiver").unwrap();
        assert_eq!(receiver.id.as_str(), "mac:F0:18:98:00:00:01");
        assert_eq!(receiver.vendor_name.as_deref(), Some("Logitech"));
        assert_eq!(receiver.backend, "bluetooth");
        assert_eq!(receiver.sources.len(), 2);
    }

    #[test]
    fn test_ambiguous_addressless_record_stays_separate() {
        let draft = |address: Option<&str>| {
            let d = DeviceDraft::new(DeviceCategory::Bluetooth, "Generic Headset");
            match address {
                Some(a) => d.address(a),
                None => d,
            }
        };
        let merged = merge_records(vec![
            candidate(40, draft(None), "usb", 0),
            candidate(70, draft(Some("AA:AA:AA:AA:AA:01")), "bluetooth", 0),
            candidate(70, draft(Some("AA:AA:AA:AA:AA:02")), "bluetooth", 0),
        ]);
        assert_eq!(merged.len(), 3);
    }
}
