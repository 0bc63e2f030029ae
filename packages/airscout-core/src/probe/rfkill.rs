//! Radio kill switches via `rfkill` (Linux only).

use super::command;
use super::{PlatformProbe, ProbeDescriptor, RawRecord};
use crate::device::{Capability, CapabilitySet, DeviceCategory, DeviceDraft, DeviceRecord, DeviceStatus};
use crate::error::{ManagementError, NormalizationError, ProbeError};
use crate::manager::ManagementAction;

const NAME: &str = "rfkill";

pub struct RfkillProbe {
    descriptor: ProbeDescriptor,
}

impl RfkillProbe {
    pub fn new() -> Self {
        Self {
            descriptor: ProbeDescriptor {
                name: NAME,
                categories: vec![DeviceCategory::Bluetooth, DeviceCategory::WifiAdapter],
                priority: 80,
            },
        }
    }
}

impl Default for RfkillProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for RfkillProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    fn availability(&self) -> bool {
        cfg!(target_os = "linux") && command::is_installed("rfkill")
    }

    fn list(&self) -> Result<Vec<RawRecord>, ProbeError> {
        if !cfg!(target_os = "linux") {
            return Err(ProbeError::unavailable(NAME, "rfkill is Linux only"));
        }
        let output = command::run("rfkill", &["list"]).map_err(|e| e.into_probe_error(NAME))?;
        Ok(parse_rfkill_list(&output))
    }

    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError> {
        let device = raw.require(NAME, "device")?;
        let kind = raw.require(NAME, "type")?;

        let category = match kind.to_lowercase().as_str() {
            "wireless lan" | "wlan" => DeviceCategory::WifiAdapter,
            "bluetooth" => DeviceCategory::Bluetooth,
            other => {
                return Err(NormalizationError::new(
                    NAME,
                    format!("unsupported radio type '{}'", other),
                ));
            }
        };

        let soft = raw.get("soft") == Some("yes");
        let hard = raw.get("hard") == Some("yes");
        let status = if soft || hard {
            DeviceStatus::Disabled
        } else {
            DeviceStatus::Enabled
        };

        // A hardware switch can only be flipped by the user
        let capabilities = if hard {
            CapabilitySet::new([Capability::CanDisable])
        } else {
            CapabilitySet::toggle()
        };

        Ok(DeviceDraft::new(category, format!("{} radio ({})", kind, device))
            .address(format!("rfkill/{}", device))
            .status(status)
            .capabilities(capabilities))
    }

    fn apply(&self, record: &DeviceRecord, action: ManagementAction) -> Result<(), ManagementError> {
        let raw = record
            .raw
            .get(NAME)
            .ok_or_else(|| ManagementError::failed("device was not reported by rfkill"))?;
        let index = raw
            .get("index")
            .ok_or_else(|| ManagementError::failed("rfkill record has no index"))?;

        if action == ManagementAction::Enable && raw.get("hard").map(String::as_str) == Some("yes") {
            return Err(ManagementError::unsupported(format!(
                "{} is blocked by a hardware switch",
                record.name
            )));
        }

        let verb = match action {
            ManagementAction::Enable => "unblock",
            ManagementAction::Disable => "block",
        };
        command::run("rfkill", &[verb, index])
            .map(|_| ())
            .map_err(|e| e.into_management_error())
    }
}

/// Parse `rfkill list` output.
///
/// ```text
/// 0: phy0: Wireless LAN
///         Soft blocked: no
///         Hard blocked: no
/// ```
pub fn parse_rfkill_list(output: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    let mut current: Option<RawRecord> = None;

    for line in output.lines() {
        let indented = line.starts_with(char::is_whitespace);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if !indented {
            if let Some(done) = current.take() {
                records.push(done);
            }
            let mut parts = line.splitn(3, ':');
            let (Some(index), Some(device), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            if index.trim().parse::<u32>().is_err() {
                continue;
            }
            current = Some(
                RawRecord::new()
                    .with("index", index)
                    .with("device", device)
                    .with("type", kind),
            );
        } else if let Some(record) = current.as_mut() {
            if let Some(value) = line.strip_prefix("Soft blocked:") {
                record.insert("soft", value.to_lowercase());
            } else if let Some(value) = line.strip_prefix("Hard blocked:") {
                record.insert("hard", value.to_lowercase());
            }
        }
    }

    if let Some(done) = current.take() {
        records.push(done);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RawFields;
    use chrono::Utc;

    const LISTING: &str = "\
0: phy0: Wireless LAN
\tSoft blocked: no
\tHard blocked: no
1: hci0: Bluetooth
\tSoft blocked: yes
\tHard blocked: no
2: thinkpad_acpi_wwan: Wireless WAN
\tSoft blocked: no
\tHard blocked: yes
";

    #[test]
    fn test_parse_rfkill_list() {
        let records = parse_rfkill_list(LISTING);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("device"), Some("phy0"));
        assert_eq!(records[0].get("type"), Some("Wireless LAN"));
        assert_eq!(records[1].get("index"), Some("1"));
        assert_eq!(records[1].get("soft"), Some("yes"));
        assert_eq!(records[2].get("hard"), Some("yes"));
    }

    #[test]
    fn test_normalize_radios() {
        let probe = RfkillProbe::new();
        let records = parse_rfkill_list(LISTING);

        let wifi = probe.normalize(&records[0]).unwrap();
        assert_eq!(wifi.category, DeviceCategory::WifiAdapter);
        assert_eq!(wifi.status, DeviceStatus::Enabled);
        assert_eq!(wifi.address.as_deref(), Some("rfkill/phy0"));

        let bt = probe.normalize(&records[1]).unwrap();
        assert_eq!(bt.category, DeviceCategory::Bluetooth);
        assert_eq!(bt.status, DeviceStatus::Disabled);
        assert!(bt.capabilities.allows(ManagementAction::Enable));

        assert!(probe.normalize(&records[2]).is_err());
    }

    #[test]
    fn test_hard_blocked_radio_cannot_be_enabled() {
        let probe = RfkillProbe::new();
        let raw = RawRecord::new()
            .with("index", "0")
            .with("device", "phy0")
            .with("type", "Wireless LAN")
            .with("soft", "no")
            .with("hard", "yes");

        let draft = probe.normalize(&raw).unwrap();
        assert!(!draft.capabilities.allows(ManagementAction::Enable));
        assert!(draft.capabilities.allows(ManagementAction::Disable));

        let record = draft
            .into_record(NAME, raw.fields.clone(), Utc::now())
            .unwrap();
        let result = probe.apply(&record, ManagementAction::Enable);
        assert!(matches!(result, Err(ManagementError::Unsupported(_))));
    }

    #[test]
    fn test_apply_requires_rfkill_payload() {
        let record = DeviceDraft::new(DeviceCategory::Bluetooth, "hci0")
            .address("aa:bb:cc:dd:ee:ff")
            .into_record("bluetooth", RawFields::new(), Utc::now())
            .unwrap();
        let result = RfkillProbe::new().apply(&record, ManagementAction::Disable);
        assert!(matches!(result, Err(ManagementError::Failed(_))));
    }
}
