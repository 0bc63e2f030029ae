//! Wireless network interfaces.
//!
//! - Linux: `/sys/class/net/<if>/wireless`, admin state from `flags`
//! - macOS: `networksetup -listallhardwareports` and `-getairportpower`
//! - Windows: `netsh wlan show interfaces`

use super::command;
use super::{PlatformProbe, ProbeDescriptor, RawRecord};
use crate::device::{CapabilitySet, DeviceCategory, DeviceDraft, DeviceRecord, DeviceStatus};
use crate::error::{ManagementError, NormalizationError, ProbeError};
use crate::manager::ManagementAction;
use std::path::Path;

const NAME: &str = "network";

#[cfg(target_os = "linux")]
const SYSFS_NET: &str = "/sys/class/net";

/// Linux `IFF_UP` interface flag.
const IFF_UP: u32 = 0x1;

pub struct NetworkProbe {
    descriptor: ProbeDescriptor,
}

impl NetworkProbe {
    pub fn new() -> Self {
        Self {
            descriptor: ProbeDescriptor {
                name: NAME,
                categories: vec![DeviceCategory::WifiAdapter],
                priority: 90,
            },
        }
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for NetworkProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    fn availability(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            Path::new(SYSFS_NET).is_dir()
        }

        #[cfg(target_os = "macos")]
        {
            command::is_installed("networksetup")
        }

        #[cfg(target_os = "windows")]
        {
            command::is_installed("netsh")
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            false
        }
    }

    fn list(&self) -> Result<Vec<RawRecord>, ProbeError> {
        #[cfg(target_os = "linux")]
        {
            read_sysfs_interfaces(Path::new(SYSFS_NET)).map_err(|e| ProbeError::execution(NAME, e.to_string()))
        }

        #[cfg(target_os = "macos")]
        {
            let output = command::run("networksetup", &["-listallhardwareports"])
                .map_err(|e| e.into_probe_error(NAME))?;
            let mut records = parse_hardware_ports(&output);
            for record in records.iter_mut() {
                if let Some(device) = record.get("interface").map(str::to_string) {
                    match command::run("networksetup", &["-getairportpower", &device]) {
                        Ok(power) => record.insert("state", parse_airport_power(&power)),
                        Err(e) => tracing::debug!("airport power for {} unavailable: {:?}", device, e),
                    }
                }
            }
            Ok(records)
        }

        #[cfg(target_os = "windows")]
        {
            match command::run("netsh", &["wlan", "show", "interfaces"]) {
                Ok(output) => Ok(parse_netsh_interfaces(&output)),
                // The WLAN AutoConfig service is stopped when no wireless hardware exists
                Err(command::CommandError::Failed { message, .. })
                    if message.to_lowercase().contains("wlansvc") =>
                {
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into_probe_error(NAME)),
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            Err(ProbeError::unavailable(NAME, "unsupported platform"))
        }
    }

    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError> {
        let interface = raw.require(NAME, "interface")?;
        let name = raw
            .get("description")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Wireless Interface {}", interface));

        let status = match raw.get("state") {
            Some("up") | Some("on") | Some("connected") => DeviceStatus::Enabled,
            Some("down") | Some("off") => DeviceStatus::Disabled,
            Some(_) => DeviceStatus::Enabled,
            None => DeviceStatus::Unknown,
        };

        let mut draft = DeviceDraft::new(DeviceCategory::WifiAdapter, name)
            .address(raw.get("address").unwrap_or(interface))
            .status(status)
            .capabilities(CapabilitySet::toggle());
        draft.signal_strength = raw.get("signal").and_then(|s| s.parse().ok());

        Ok(draft)
    }

    fn apply(&self, record: &DeviceRecord, action: ManagementAction) -> Result<(), ManagementError> {
        let interface = record
            .raw
            .get(NAME)
            .and_then(|raw| raw.get("interface"))
            .ok_or_else(|| ManagementError::failed("device was not reported by the network backend"))?;

        #[cfg(target_os = "linux")]
        {
            let state = match action {
                ManagementAction::Enable => "up",
                ManagementAction::Disable => "down",
            };
            command::run("ip", &["link", "set", "dev", interface, state])
                .map(|_| ())
                .map_err(|e| e.into_management_error())
        }

        #[cfg(target_os = "macos")]
        {
            let state = match action {
                ManagementAction::Enable => "on",
                ManagementAction::Disable => "off",
            };
            command::run("networksetup", &["-setairportpower", interface, state])
                .map(|_| ())
                .map_err(|e| e.into_management_error())
        }

        #[cfg(target_os = "windows")]
        {
            let admin = match action {
                ManagementAction::Enable => "admin=enabled",
                ManagementAction::Disable => "admin=disabled",
            };
            let name_arg = format!("name={}", interface);
            command::run("netsh", &["interface", "set", "interface", &name_arg, admin])
                .map(|_| ())
                .map_err(|e| e.into_management_error())
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            let _ = (interface, action);
            Err(ManagementError::unsupported("unsupported platform"))
        }
    }
}

/// Enumerate wireless interfaces under a sysfs `class/net` directory.
pub fn read_sysfs_interfaces(root: &Path) -> std::io::Result<Vec<RawRecord>> {
    let mut records = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.join("wireless").exists() && !dir.join("phy80211").exists() {
            continue;
        }

        let interface = entry.file_name().to_string_lossy().to_string();
        let mut record = RawRecord::new().with("interface", interface.as_str());

        if let Ok(address) = std::fs::read_to_string(dir.join("address")) {
            if address.trim() != "00:00:00:00:00:00" {
                record.insert("address", address);
            }
        }

        if let Ok(flags) = std::fs::read_to_string(dir.join("flags")) {
            if let Some(up) = parse_iff_up(&flags) {
                record.insert("state", if up { "up" } else { "down" });
            }
        }

        records.push(record);
    }

    records.sort_by(|a, b| a.get("interface").cmp(&b.get("interface")));
    Ok(records)
}

/// Parse a sysfs `flags` value such as `0x1003`.
pub fn parse_iff_up(flags: &str) -> Option<bool> {
    let value = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).ok()?;
    Some(value & IFF_UP != 0)
}

/// Parse `networksetup -listallhardwareports`, keeping Wi-Fi ports.
pub fn parse_hardware_ports(output: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut current: Option<RawRecord> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(port) = line.strip_prefix("Hardware Port:") {
            if let Some(done) = current.take() {
                records.push(done);
            }
            let port = port.trim();
            let lower = port.to_lowercase();
            if lower.contains("wi-fi") || lower.contains("airport") || lower.contains("wireless") {
                current = Some(RawRecord::new().with("port", port));
            }
        } else if let Some(record) = current.as_mut() {
            if let Some(device) = line.strip_prefix("Device:") {
                record.insert("interface", device);
                record.insert("description", format!("Wireless Interface {}", device.trim()));
            } else if let Some(address) = line.strip_prefix("Ethernet Address:") {
                record.insert("address", address);
            }
        }
    }

    if let Some(done) = current.take() {
        records.push(done);
    }

    records.retain(|r| r.get("interface").is_some());
    records
}

/// Parse `Wi-Fi Power (en0): On`.
pub fn parse_airport_power(output: &str) -> &'static str {
    match output.rsplit(':').next().map(|s| s.trim().to_lowercase()) {
        Some(state) if state == "on" => "on",
        Some(state) if state == "off" => "off",
        _ => "unknown",
    }
}

/// Parse `netsh wlan show interfaces` blocks.
pub fn parse_netsh_interfaces(output: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut current: Option<RawRecord> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "name" => {
                if let Some(done) = current.take() {
                    records.push(done);
                }
                current = Some(RawRecord::new().with("interface", value));
            }
            "description" => {
                if let Some(record) = current.as_mut() {
                    record.insert("description", value);
                }
            }
            "physical address" => {
                if let Some(record) = current.as_mut() {
                    record.insert("address", value);
                }
            }
            "state" => {
                if let Some(record) = current.as_mut() {
                    record.insert("state", value.to_lowercase());
                }
            }
            "signal" => {
                if let Some(record) = current.as_mut() {
                    record.insert("signal", value.trim_end_matches('%'));
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current.take() {
        records.push(done);
    }
    records
}
