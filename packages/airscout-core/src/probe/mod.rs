//! Platform probes.
//!
//! A probe wraps one OS enumeration mechanism (a CLI tool, sysfs, PowerShell)
//! for one or more device categories. Probes are registered once in a
//! [`ProbeTable`] and selected by category and priority; the pipeline never
//! branches on platform itself.
//!
//! Probe methods are synchronous and may block on child processes. The
//! pipeline runs them on the blocking pool under a timeout.

pub mod bluetooth;
pub mod command;
pub mod network;
pub mod rfkill;
pub mod usb;

use crate::config::AgentConfig;
use crate::device::{DeviceCategory, DeviceDraft, DeviceRecord, RawFields};
use crate::error::{ManagementError, NormalizationError, ProbeError};
use crate::manager::ManagementAction;
use std::sync::Arc;

/// Static description of a probe, fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub name: &'static str,
    pub categories: Vec<DeviceCategory>,
    /// Higher wins merge conflicts and is tried first.
    pub priority: u8,
}

/// One device as reported by a probe, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub fields: RawFields,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let value = value.trim();
        if !value.is_empty() {
            self.fields.insert(key.to_string(), value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn require(&self, probe: &str, key: &str) -> Result<&str, NormalizationError> {
        self.get(key)
            .ok_or_else(|| NormalizationError::new(probe, format!("missing field '{}'", key)))
    }
}

/// Capability-based interface implemented once per enumeration mechanism.
pub trait PlatformProbe: Send + Sync {
    fn descriptor(&self) -> &ProbeDescriptor;

    /// Whether the underlying tool or API is present on this host.
    fn availability(&self) -> bool;

    fn supports(&self, category: DeviceCategory) -> bool {
        self.descriptor().categories.contains(&category)
    }

    /// Enumerate devices. An empty list is a valid answer.
    fn list(&self) -> Result<Vec<RawRecord>, ProbeError>;

    /// Adapt one raw record to the canonical schema.
    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError>;

    /// Enable or disable a device this probe reported.
    fn apply(&self, record: &DeviceRecord, action: ManagementAction) -> Result<(), ManagementError> {
        let _ = action;
        Err(ManagementError::unsupported(format!(
            "The {} backend has no management support for '{}'",
            self.descriptor().name,
            record.name
        )))
    }

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    fn priority(&self) -> u8 {
        self.descriptor().priority
    }
}

/// Registered probes, ordered by descending priority. Immutable once built.
#[derive(Clone, Default)]
pub struct ProbeTable {
    probes: Vec<Arc<dyn PlatformProbe>>,
}

impl ProbeTable {
    pub fn new(probes: Vec<Arc<dyn PlatformProbe>>) -> Self {
        let mut probes = probes;
        probes.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.name().cmp(b.name())));
        Self { probes }
    }

    /// The probes shipped for the current platform, minus those disabled in config.
    pub fn platform_default(config: &AgentConfig) -> Self {
        let candidates: Vec<Arc<dyn PlatformProbe>> = vec![
            Arc::new(network::NetworkProbe::new()),
            Arc::new(bluetooth::BluetoothProbe::new()),
            Arc::new(rfkill::RfkillProbe::new()),
            Arc::new(usb::UsbProbe::new()),
        ];

        let probes = candidates
            .into_iter()
            .filter(|p| {
                let disabled = config.disabled_probes.iter().any(|d| d == p.name());
                if disabled {
                    tracing::info!("Probe {} disabled by configuration", p.name());
                }
                !disabled
            })
            .collect();

        Self::new(probes)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PlatformProbe>> {
        self.probes.iter().find(|p| p.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PlatformProbe>> {
        self.probes.iter()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Probes supporting `category`, highest priority first.
    pub fn for_category(&self, category: DeviceCategory) -> Vec<Arc<dyn PlatformProbe>> {
        self.probes
            .iter()
            .filter(|p| p.supports(category))
            .cloned()
            .collect()
    }

    /// Probes needed to cover every category, each listed once.
    pub fn for_cycle(&self) -> Vec<Arc<dyn PlatformProbe>> {
        let mut selected: Vec<Arc<dyn PlatformProbe>> = Vec::new();
        for category in DeviceCategory::ALL {
            for probe in self.for_category(category) {
                if !selected.iter().any(|p| p.name() == probe.name()) {
                    selected.push(probe);
                }
            }
        }
        selected.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.name().cmp(b.name())));
        selected
    }
}

impl std::fmt::Debug for ProbeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.probes.iter().map(|p| p.descriptor()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    #[test]
    fn test_table_orders_by_priority() {
        let table = ProbeTable::new(vec![
            Arc::new(FakeProbe::new("low", 10, &[DeviceCategory::Bluetooth])),
            Arc::new(FakeProbe::new("high", 90, &[DeviceCategory::Bluetooth])),
            Arc::new(FakeProbe::new("wifi", 50, &[DeviceCategory::WifiAdapter])),
        ]);

        let names: Vec<&str> = table.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["high", "wifi", "low"]);

        let bt: Vec<&str> = table
            .for_category(DeviceCategory::Bluetooth)
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(bt, vec!["high", "low"]);
        assert!(table.for_category(DeviceCategory::RfDongle).is_empty());
    }

    #[test]
    fn test_cycle_selection_lists_each_probe_once() {
        let table = ProbeTable::new(vec![
            Arc::new(FakeProbe::new(
                "multi",
                40,
                &[DeviceCategory::Bluetooth, DeviceCategory::WifiAdapter],
            )),
            Arc::new(FakeProbe::new("none", 30, &[])),
        ]);
        let names: Vec<&str> = table.for_cycle().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["multi"]);
    }

    #[test]
    fn test_default_table_respects_disabled_probes() {
        let config = AgentConfig {
            disabled_probes: vec!["usb".to_string()],
            ..AgentConfig::default()
        };
        let table = ProbeTable::platform_default(&config);
        assert!(table.get("usb").is_none());
        assert!(table.get("network").is_some());
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_raw_record_skips_blank_values() {
        let raw = RawRecord::new().with("name", "  Mouse ").with("address", "   ");
        assert_eq!(raw.get("name"), Some("Mouse"));
        assert_eq!(raw.get("address"), None);
        assert!(raw.require("usb", "address").is_err());
    }
}
