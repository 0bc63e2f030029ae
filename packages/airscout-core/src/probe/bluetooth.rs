//! Bluetooth controllers and paired devices.
//!
//! - Linux: `bluetoothctl` (controllers, paired and connected devices)
//! - macOS: `system_profiler SPBluetoothDataType`
//! - Windows: `Get-PnpDevice -Class Bluetooth` through PowerShell

use super::command;
use super::{PlatformProbe, ProbeDescriptor, RawRecord};
use crate::device::{classify_by_name, CapabilitySet, DeviceCategory, DeviceDraft, DeviceRecord, DeviceStatus};
use crate::error::{ManagementError, NormalizationError, ProbeError};
use crate::manager::ManagementAction;

const NAME: &str = "bluetooth";

pub struct BluetoothProbe {
    descriptor: ProbeDescriptor,
}

impl BluetoothProbe {
    pub fn new() -> Self {
        Self {
            descriptor: ProbeDescriptor {
                name: NAME,
                categories: vec![DeviceCategory::Bluetooth, DeviceCategory::WirelessAudio],
                priority: 70,
            },
        }
    }
}

impl Default for BluetoothProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for BluetoothProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    fn availability(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            command::is_installed("bluetoothctl")
        }

        #[cfg(target_os = "macos")]
        {
            command::is_installed("system_profiler")
        }

        #[cfg(target_os = "windows")]
        {
            command::is_installed("powershell")
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            false
        }
    }

    fn list(&self) -> Result<Vec<RawRecord>, ProbeError> {
        #[cfg(target_os = "linux")]
        {
            list_linux()
        }

        #[cfg(target_os = "macos")]
        {
            let output = command::run("system_profiler", &["SPBluetoothDataType"])
                .map_err(|e| e.into_probe_error(NAME))?;
            Ok(parse_system_profiler(&output))
        }

        #[cfg(target_os = "windows")]
        {
            let output = command::run(
                "powershell",
                &[
                    "-NoProfile",
                    "-ExecutionPolicy",
                    "Bypass",
                    "-Command",
                    "Get-PnpDevice -Class Bluetooth -PresentOnly -ErrorAction SilentlyContinue | \
                     ForEach-Object { \"$($_.FriendlyName)|$($_.Status)|$($_.InstanceId)\" }",
                ],
            )
            .map_err(|e| e.into_probe_error(NAME))?;
            Ok(parse_pnp_listing(&output))
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            Err(ProbeError::unavailable(NAME, "unsupported platform"))
        }
    }

    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError> {
        let kind = raw.require(NAME, "kind")?;
        let name = raw.get("name").unwrap_or_default();

        let (category, capabilities) = match kind {
            "controller" => {
                let manageable = raw.get("default") == Some("yes");
                let caps = if manageable {
                    CapabilitySet::toggle()
                } else {
                    CapabilitySet::info_only()
                };
                (DeviceCategory::Bluetooth, caps)
            }
            "device" => {
                let category = match classify_by_name(name) {
                    Some(DeviceCategory::WirelessAudio) => DeviceCategory::WirelessAudio,
                    _ => DeviceCategory::Bluetooth,
                };
                let caps = if cfg!(target_os = "linux") {
                    CapabilitySet::toggle()
                } else {
                    CapabilitySet::info_only()
                };
                (category, caps)
            }
            "pnp" => {
                let category = match classify_by_name(name) {
                    Some(DeviceCategory::WirelessAudio) => DeviceCategory::WirelessAudio,
                    _ => DeviceCategory::Bluetooth,
                };
                (category, CapabilitySet::toggle())
            }
            other => {
                return Err(NormalizationError::new(
                    NAME,
                    format!("unknown record kind '{}'", other),
                ));
            }
        };

        let address = raw
            .get("address")
            .or_else(|| raw.get("instance_id"))
            .ok_or_else(|| NormalizationError::new(NAME, "record has no address"))?;

        Ok(DeviceDraft::new(category, name)
            .address(address)
            .status(parse_status(raw.get("status")))
            .capabilities(capabilities))
    }

    fn apply(&self, record: &DeviceRecord, action: ManagementAction) -> Result<(), ManagementError> {
        let raw = record
            .raw
            .get(NAME)
            .ok_or_else(|| ManagementError::failed("device was not reported by the bluetooth backend"))?;
        let kind = raw.get("kind").map(String::as_str).unwrap_or_default();

        match kind {
            #[cfg(target_os = "linux")]
            "controller" => {
                let state = match action {
                    ManagementAction::Enable => "on",
                    ManagementAction::Disable => "off",
                };
                run_bluetoothctl(&["power", state])
            }
            #[cfg(target_os = "linux")]
            "device" => {
                let mac = record
                    .address
                    .as_deref()
                    .ok_or_else(|| ManagementError::failed("device has no address"))?;
                let verb = match action {
                    ManagementAction::Enable => "connect",
                    ManagementAction::Disable => "disconnect",
                };
                run_bluetoothctl(&[verb, mac])
            }
            #[cfg(target_os = "windows")]
            "pnp" => {
                let instance_id = raw
                    .get("instance_id")
                    .ok_or_else(|| ManagementError::failed("device has no instance id"))?;
                set_pnp_device_state(instance_id, action)
            }
            _ => Err(ManagementError::unsupported(format!(
                "'{}' cannot be managed on this platform",
                record.name
            ))),
        }
    }
}

/// bluetoothctl exits 0 on many failures and reports them on stdout.
#[cfg(target_os = "linux")]
fn run_bluetoothctl(args: &[&str]) -> Result<(), ManagementError> {
    let output = command::run("bluetoothctl", args).map_err(|e| e.into_management_error())?;
    let lower = output.to_lowercase();
    if lower.contains("not available") || lower.contains("failed") || lower.contains("org.bluez.error") {
        let message = output.trim().to_string();
        if command::is_permission_error(&message) {
            return Err(ManagementError::permission_denied(message));
        }
        return Err(ManagementError::failed(format!("bluetoothctl: {}", message)));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
pub(crate) fn set_pnp_device_state(instance_id: &str, action: ManagementAction) -> Result<(), ManagementError> {
    let cmdlet = match action {
        ManagementAction::Enable => "Enable-PnpDevice",
        ManagementAction::Disable => "Disable-PnpDevice",
    };
    let script = format!(
        "{} -InstanceId '{}' -Confirm:$false -ErrorAction Stop",
        cmdlet,
        instance_id.replace('\'', "''")
    );
    command::run(
        "powershell",
        &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script],
    )
    .map(|_| ())
    .map_err(|e| e.into_management_error())
}

#[cfg(target_os = "linux")]
fn list_linux() -> Result<Vec<RawRecord>, ProbeError> {
    let controllers = command::run("bluetoothctl", &["list"]).map_err(|e| e.into_probe_error(NAME))?;
    let mut records = parse_controllers(&controllers);

    for record in records.iter_mut() {
        if let Some(mac) = record.get("address").map(str::to_string) {
            match command::run("bluetoothctl", &["show", &mac]) {
                Ok(show) => record.insert("status", parse_powered(&show)),
                Err(e) => tracing::debug!("bluetoothctl show {} failed: {:?}", mac, e),
            }
        }
    }

    // `devices Paired` replaced `paired-devices` in BlueZ 5.65
    let paired = command::run("bluetoothctl", &["devices", "Paired"])
        .or_else(|_| command::run("bluetoothctl", &["paired-devices"]))
        .unwrap_or_default();
    let connected = command::run("bluetoothctl", &["devices", "Connected"]).unwrap_or_default();

    records.extend(parse_devices(&paired, &connected));
    Ok(records)
}

/// Parse `bluetoothctl list`: `Controller 00:1A:7D:DA:71:13 host [default]`.
pub fn parse_controllers(output: &str) -> Vec<RawRecord> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Controller ")?;
            let (mac, name) = rest.split_once(' ').unwrap_or((rest, ""));
            let is_default = name.contains("[default]");
            let name = name.replace("[default]", "");
            Some(
                RawRecord::new()
                    .with("kind", "controller")
                    .with("address", mac)
                    .with("name", name)
                    .with("default", if is_default { "yes" } else { "no" }),
            )
        })
        .collect()
}

/// Parse `bluetoothctl show`: `Powered: yes`.
pub fn parse_powered(output: &str) -> &'static str {
    let powered = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Powered:").map(|v| v.trim() == "yes"));
    match powered {
        Some(true) => "powered",
        Some(false) => "off",
        None => "unknown",
    }
}

/// Parse `bluetoothctl devices`: `Device AA:BB:CC:DD:EE:FF Name`.
pub fn parse_devices(paired: &str, connected: &str) -> Vec<RawRecord> {
    let connected_macs: Vec<&str> = connected
        .lines()
        .filter_map(|l| l.trim().strip_prefix("Device "))
        .filter_map(|rest| rest.split_whitespace().next())
        .collect();

    paired
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Device ")?;
            let (mac, name) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = if connected_macs.contains(&mac) {
                "connected"
            } else {
                "disconnected"
            };
            Some(
                RawRecord::new()
                    .with("kind", "device")
                    .with("address", mac)
                    .with("name", name)
                    .with("status", status),
            )
        })
        .collect()
}

/// Parse `system_profiler SPBluetoothDataType`.
///
/// Device sections are indented headers ending in `:` followed by an
/// `Address:` line; `Connected:`/`Not Connected:` headers group them.
pub fn parse_system_profiler(output: &str) -> Vec<RawRecord> {
    let mut records: Vec<RawRecord> = Vec::new();
    let mut header = String::new();
    let mut connected: Option<bool> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(title) = trimmed.strip_suffix(':') {
            if !title.contains(':') {
                match title {
                    "Connected" => connected = Some(true),
                    "Not Connected" => connected = Some(false),
                    _ => header = title.to_string(),
                }
                continue;
            }
        }

        if let Some(address) = trimmed.strip_prefix("Address:") {
            let is_controller = header == "Bluetooth Controller";
            let mut record = RawRecord::new()
                .with("kind", if is_controller { "controller" } else { "device" })
                .with("address", address)
                .with("name", header.as_str());
            if !is_controller {
                let status = match connected {
                    Some(true) => "connected",
                    Some(false) => "disconnected",
                    None => "unknown",
                };
                record.insert("status", status);
            }
            records.push(record);
        } else if let Some(state) = trimmed.strip_prefix("State:") {
            if let Some(last) = records.last_mut() {
                if last.get("kind") == Some("controller") {
                    let status = if state.trim().eq_ignore_ascii_case("on") {
                        "powered"
                    } else {
                        "off"
                    };
                    last.insert("status", status);
                }
            }
        }
    }

    records
}

/// Parse `FriendlyName|Status|InstanceId` lines from PowerShell.
pub fn parse_pnp_listing(output: &str) -> Vec<RawRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|');
            let name = parts.next()?.trim();
            let status = parts.next()?.trim();
            let instance_id = parts.next()?.trim();
            if instance_id.is_empty() {
                return None;
            }
            let mut record = RawRecord::new()
                .with("kind", "pnp")
                .with("name", name)
                .with("status", status.to_lowercase())
                .with("instance_id", instance_id);
            if let Some(mac) = mac_from_instance_id(instance_id) {
                record.insert("address", mac);
            }
            Some(record)
        })
        .collect()
}

/// Bluetooth PnP instance ids embed the device address after `DEV_` or as
/// the trailing `&XXXXXXXXXXXX_` group.
pub fn mac_from_instance_id(instance_id: &str) -> Option<String> {
    let upper = instance_id.to_uppercase();
    let candidate = if let Some(pos) = upper.find("DEV_") {
        upper.get(pos + 4..pos + 16)?.to_string()
    } else {
        let tail = upper.rsplit('&').next()?;
        tail.split('_').next()?.to_string()
    };

    if candidate.len() != 12 || !candidate.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let octets: Vec<&str> = (0..6).filter_map(|i| candidate.get(i * 2..i * 2 + 2)).collect();
    Some(octets.join(":"))
}

fn parse_status(raw: Option<&str>) -> DeviceStatus {
    match raw {
        Some("powered") | Some("connected") | Some("ok") => DeviceStatus::Enabled,
        Some("off") | Some("disconnected") => DeviceStatus::Disabled,
        Some("error") | Some("degraded") => DeviceStatus::Error,
        _ => DeviceStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controllers() {
        let output = "Controller 00:1A:7D:DA:71:13 thinkpad [default]\n\
                      Controller 5C:F3:70:8B:12:01 usb-dongle\n\
                      Agent registered\n";
        let records = parse_controllers(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("address"), Some("00:1A:7D:DA:71:13"));
        assert_eq!(records[0].get("name"), Some("thinkpad"));
        assert_eq!(records[0].get("default"), Some("yes"));
        assert_eq!(records[1].get("default"), Some("no"));
    }

    #[test]
    fn test_parse_powered() {
        assert_eq!(parse_powered("Controller X\n\tPowered: yes\n"), "powered");
        assert_eq!(parse_powered("\tPowered: no"), "off");
        assert_eq!(parse_powered("garbage"), "unknown");
    }

    #[test]
    fn test_parse_devices_marks_connected() {
        let paired = "Device 40:ED:CF:11:22:33 WH-1000XM4 Headset\nDevice 11:22:33:44:55:66 MX Keys\n";
        let connected = "Device 40:ED:CF:11:22:33 WH-1000XM4 Headset\n";
        let records = parse_devices(paired, connected);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("status"), Some("connected"));
        assert_eq!(records[1].get("status"), Some("disconnected"));
        assert_eq!(records[1].get("name"), Some("MX Keys"));
    }

    #[test]
    fn test_normalize_headset_is_audio() {
        let probe = BluetoothProbe::new();
        let raw = RawRecord::new()
            .with("kind", "device")
            .with("address", "40:ed:cf:11:22:33")
            .with("name", "WH-1000XM4 Headset")
            .with("status", "connected");
        let draft = probe.normalize(&raw).unwrap();
        assert_eq!(draft.category, DeviceCategory::WirelessAudio);
        assert_eq!(draft.status, DeviceStatus::Enabled);
    }

    #[test]
    fn test_normalize_non_default_controller_is_info_only() {
        let probe = BluetoothProbe::new();
        let raw = RawRecord::new()
            .with("kind", "controller")
            .with("address", "5C:F3:70:8B:12:01")
            .with("default", "no")
            .with("status", "off");
        let draft = probe.normalize(&raw).unwrap();
        assert_eq!(draft.category, DeviceCategory::Bluetooth);
        assert_eq!(draft.status, DeviceStatus::Disabled);
        assert!(draft.capabilities.is_info_only());
    }

    #[test]
    fn test_normalize_rejects_unknown_kind() {
        let probe = BluetoothProbe::new();
        let raw = RawRecord::new().with("kind", "mystery").with("address", "AA:BB");
        assert!(probe.normalize(&raw).is_err());
        assert!(probe.normalize(&RawRecord::new()).is_err());
    }

    #[test]
    fn test_parse_system_profiler() {
        let output = "\
Bluetooth:

      Bluetooth Controller:
          Address: F0:18:98:AA:BB:CC
          State: On
          Chipset: BCM_4350C2
      Connected:
          AirPods Pro:
              Address: 40:ED:CF:11:22:33
              Vendor ID: 0x004C
      Not Connected:
          Magic Keyboard:
              Address: 11-22-33-44-55-66
";
        let records = parse_system_profiler(output);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("kind"), Some("controller"));
        assert_eq!(records[0].get("status"), Some("powered"));
        assert_eq!(records[1].get("name"), Some("AirPods Pro"));
        assert_eq!(records[1].get("status"), Some("connected"));
        assert_eq!(records[2].get("name"), Some("Magic Keyboard"));
        assert_eq!(records[2].get("status"), Some("disconnected"));
    }

    #[test]
    fn test_parse_pnp_listing() {
        let output = "Intel(R) Wireless Bluetooth(R)|OK|USB\\VID_8087&PID_0026\\5&2F4C&0&10\n\
                      Jabra Elite 85t|OK|BTHENUM\\DEV_50C2ED112233\\7&1A2B&0&BLUETOOTHDEVICE_50C2ED112233\n\
                      broken line\n";
        let records = parse_pnp_listing(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("address"), None);
        assert_eq!(records[1].get("address"), Some("50:C2:ED:11:22:33"));
        assert_eq!(records[1].get("status"), Some("ok"));
    }

    #[test]
    fn test_mac_from_instance_id() {
        assert_eq!(
            mac_from_instance_id("BTHENUM\\{0000110B-0000-1000-8000-00805F9B34FB}_LOCALMFG&0002\\7&29C3&0&A0B1C2D3E4F5_C00000000"),
            Some("A0:B1:C2:D3:E4:F5".to_string())
        );
        assert_eq!(mac_from_instance_id("USB\\VID_8087&PID_0026\\5&2F4C&0&10"), None);
    }
}
