//! USB wireless hardware: receivers, dongles and plug-in adapters.
//!
//! Reported for inventory only; the bus offers no uniform power control.
//!
//! - Linux: `lsusb`
//! - macOS: `system_profiler SPUSBDataType`
//! - Windows: `Get-PnpDevice` filtered to `USB\VID_*` instance ids

use super::command;
use super::{PlatformProbe, ProbeDescriptor, RawRecord};
use crate::device::{classify_by_name, looks_wireless, CapabilitySet, DeviceCategory, DeviceDraft, DeviceStatus};
use crate::error::{NormalizationError, ProbeError};

const NAME: &str = "usb";

/// Vendors whose USB products are predominantly wireless peripherals.
pub const WIRELESS_VENDORS: &[(&str, &str)] = &[
    ("046d", "Logitech"),
    ("045e", "Microsoft"),
    ("1532", "Razer"),
    ("0b05", "ASUS"),
    ("0bda", "Realtek"),
    ("148f", "Ralink"),
    ("0cf3", "Atheros"),
    ("8087", "Intel"),
];

pub fn wireless_vendor(vendor_id: &str) -> Option<&'static str> {
    let vendor_id = vendor_id.trim().trim_start_matches("0x").to_lowercase();
    WIRELESS_VENDORS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
}

pub struct UsbProbe {
    descriptor: ProbeDescriptor,
}

impl UsbProbe {
    pub fn new() -> Self {
        Self {
            descriptor: ProbeDescriptor {
                name: NAME,
                categories: vec![
                    DeviceCategory::RfDongle,
                    DeviceCategory::UsbWireless,
                    DeviceCategory::WifiAdapter,
                    DeviceCategory::Bluetooth,
                    DeviceCategory::WirelessAudio,
                ],
                priority: 40,
            },
        }
    }
}

impl Default for UsbProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for UsbProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    fn availability(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            command::is_installed("lsusb")
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
        let records = {
            let output = command::run("lsusb", &[]).map_err(|e| e.into_probe_error(NAME))?;
            parse_lsusb(&output)
        };

        #[cfg(target_os = "macos")]
        let records = {
            let output = command::run("system_profiler", &["SPUSBDataType"])
                .map_err(|e| e.into_probe_error(NAME))?;
            parse_system_profiler_usb(&output)
        };

        #[cfg(target_os = "windows")]
        let records = {
            let output = command::run(
                "powershell",
                &[
                    "-NoProfile",
                    "-ExecutionPolicy",
                    "Bypass",
                    "-Command",
                    "Get-PnpDevice -PresentOnly -ErrorAction SilentlyContinue | \
                     Where-Object { $_.InstanceId -like 'USB\\VID_*' } | \
                     ForEach-Object { \"$($_.FriendlyName)|$($_.Status)|$($_.InstanceId)\" }",
                ],
            )
            .map_err(|e| e.into_probe_error(NAME))?;
            parse_pnp_usb(&output)
        };

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        let records: Vec<RawRecord> = {
            return Err(ProbeError::unavailable(NAME, "unsupported platform"));
        };

        Ok(records.into_iter().filter(is_wireless_candidate).collect())
    }

    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError> {
        let name = raw.require(NAME, "name")?;
        let vendor_id = raw.get("vendor_id").map(str::to_string);
        let product_id = raw.get("product_id").map(str::to_string);
        let category = classify_by_name(name).unwrap_or(DeviceCategory::UsbWireless);

        let status = match raw.get("status") {
            Some("error") | Some("degraded") => DeviceStatus::Error,
            _ => DeviceStatus::Enabled,
        };

        let mut draft = DeviceDraft::new(category, name)
            .ids(vendor_id.clone(), product_id)
            .status(status)
            .capabilities(CapabilitySet::info_only());

        let vendor = raw
            .get("manufacturer")
            .or_else(|| vendor_id.as_deref().and_then(wireless_vendor));
        if let Some(vendor) = vendor {
            draft = draft.vendor_name(vendor);
        }

        Ok(draft)
    }
}

/// Keep devices that advertise a wireless function by name, or come from a
/// known wireless vendor with a classifiable name.
pub fn is_wireless_candidate(record: &RawRecord) -> bool {
    let Some(name) = record.get("name") else {
        return false;
    };
    if looks_wireless(name) {
        return true;
    }
    record.get("vendor_id").and_then(wireless_vendor).is_some() && classify_by_name(name).is_some()
}

/// Parse `lsusb` lines such as
/// `Bus 001 Device 003: ID 046d:c52b Logitech, Inc. Unifying Receiver`.
pub fn parse_lsusb(output: &str) -> Vec<RawRecord> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 7 || parts[0] != "Bus" || parts[4] != "ID" {
                return None;
            }
            let (vendor_id, product_id) = parts[5].split_once(':')?;
            Some(
                RawRecord::new()
                    .with("bus", parts[1])
                    .with("device", parts[3].trim_end_matches(':'))
                    .with("vendor_id", vendor_id.to_lowercase())
                    .with("product_id", product_id.to_lowercase())
                    .with("name", parts[6..].join(" ")),
            )
        })
        .collect()
}

/// Parse the indented tree printed by `system_profiler SPUSBDataType`.
pub fn parse_system_profiler_usb(output: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut current: Option<RawRecord> = None;

    let flush = |current: &mut Option<RawRecord>, records: &mut Vec<RawRecord>| {
        if let Some(done) = current.take() {
            if done.get("vendor_id").is_some() {
                records.push(done);
            }
        }
    };

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(title) = line.strip_suffix(':') {
            flush(&mut current, &mut records);
            current = Some(RawRecord::new().with("name", title));
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Product ID" => record.insert("product_id", hex_id(value)),
            "Vendor ID" => record.insert("vendor_id", hex_id(value)),
            "Manufacturer" => record.insert("manufacturer", value),
            "Serial Number" => record.insert("serial", value),
            _ => {}
        }
    }
    flush(&mut current, &mut records);

    records
}

/// Parse `FriendlyName|Status|InstanceId` lines for USB devices.
pub fn parse_pnp_usb(output: &str) -> Vec<RawRecord> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|');
            let name = parts.next()?.trim();
            let status = parts.next()?.trim();
            let instance_id = parts.next()?.trim();

            let upper = instance_id.to_uppercase();
            let vendor_id = upper.find("VID_").and_then(|i| upper.get(i + 4..i + 8))?;
            let product_id = upper.find("PID_").and_then(|i| upper.get(i + 4..i + 8));

            let mut record = RawRecord::new()
                .with("name", name)
                .with("status", status.to_lowercase())
                .with("instance_id", instance_id)
                .with("vendor_id", vendor_id.to_lowercase());
            if let Some(product_id) = product_id {
                record.insert("product_id", product_id.to_lowercase());
            }
            Some(record)
        })
        .collect()
}

/// `0x046d  (Logitech Inc.)` -> `046d`
fn hex_id(value: &str) -> String {
    value
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches("0x")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsusb() {
        let output = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 004: ID 046D:C52B Logitech, Inc. Unifying Receiver
Bus 001 Device 005: ID 0bda:8179 Realtek Semiconductor Corp. RTL8188EUS 802.11n Wireless Network Adapter
Bus 001 Device 006: ID 8087:0026 Intel Corp. AX201 Bluetooth
garbage
";
        let records = parse_lsusb(output);
        assert_eq!(records.len(), 4);
        assert_eq!(records[1].get("vendor_id"), Some("046d"));
        assert_eq!(records[1].get("product_id"), Some("c52b"));
        assert_eq!(records[1].get("name"), Some("Logitech, Inc. Unifying Receiver"));
        assert_eq!(records[1].get("device"), Some("004"));

        let wireless: Vec<&str> = records
            .iter()
            .filter(|r| is_wireless_candidate(r))
            .filter_map(|r| r.get("name"))
            .collect();
        assert_eq!(wireless.len(), 3);
        assert!(!wireless.iter().any(|n| n.contains("root hub")));
    }

    #[test]
    fn test_normalize_classifies_and_names_vendor() {
        let probe = UsbProbe::new();
        let records = parse_lsusb("Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver\n");
        let draft = probe.normalize(&records[0]).unwrap();
        assert_eq!(draft.category, DeviceCategory::RfDongle);
        assert_eq!(draft.vendor_name.as_deref(), Some("Logitech"));
        assert_eq!(draft.vendor_id.as_deref(), Some("046d"));
        assert!(draft.capabilities.is_info_only());
        assert_eq!(draft.address, None);

        let generic = RawRecord::new().with("name", "Wireless Device").with("vendor_id", "dead");
        let draft = probe.normalize(&generic).unwrap();
        assert_eq!(draft.category, DeviceCategory::UsbWireless);
        assert_eq!(draft.vendor_name, None);
    }

    #[test]
    fn test_parse_system_profiler_usb() {
        let output = "\
USB:

    USB 3.1 Bus:

      Host Controller Driver: AppleT8112USBXHCI

        USB Receiver:

          Product ID: 0xc548
          Vendor ID: 0x046d  (Logitech Inc.)
          Version: 5.01
          Speed: Up to 12 Mb/s
          Manufacturer: Logitech
          Location ID: 0x01100000 / 1

        Flash Drive:

          Product ID: 0x5591
          Vendor ID: 0x0781  (SanDisk Corporation)
";
        let records = parse_system_profiler_usb(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some("USB Receiver"));
        assert_eq!(records[0].get("vendor_id"), Some("046d"));
        assert_eq!(records[0].get("product_id"), Some("c548"));
        assert_eq!(records[0].get("manufacturer"), Some("Logitech"));
        assert!(is_wireless_candidate(&records[0]));
        assert!(!is_wireless_candidate(&records[1]));
    }

    #[test]
    fn test_parse_pnp_usb() {
        let output = "\
Intel(R) Wireless Bluetooth(R)|OK|USB\\VID_8087&PID_0026\\5&2F4C&0&10
USB Composite Device|OK|USB\\VID_046D&PID_C52B\\5&1A2B&0&3
";
        let records = parse_pnp_usb(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("vendor_id"), Some("8087"));
        assert_eq!(records[0].get("product_id"), Some("0026"));
        assert_eq!(records[0].get("status"), Some("ok"));
        assert!(is_wireless_candidate(&records[0]));
        assert!(!is_wireless_candidate(&records[1]));
    }

    #[test]
    fn test_wireless_vendor_lookup() {
        assert_eq!(wireless_vendor("0x148F"), Some("Ralink"));
        assert_eq!(wireless_vendor("1d6b"), None);
    }
}
