//! Canonical device model.
//!
//! Every probe reports devices in its own shape; normalization turns those
//! reports into [`DeviceDraft`]s and [`DeviceDraft::into_record`] derives the
//! stable [`DeviceId`] from the normalized hardware address (or, when no
//! address is known, from vendor/product ids plus display name).

use crate::error::NormalizationError;
use crate::manager::ManagementAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Raw key/value fields reported by a probe for one device.
pub type RawFields = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Bluetooth,
    WifiAdapter,
    RfDongle,
    UsbWireless,
    WirelessAudio,
    Other,
}

impl DeviceCategory {
    pub const ALL: [DeviceCategory; 6] = [
        DeviceCategory::Bluetooth,
        DeviceCategory::WifiAdapter,
        DeviceCategory::RfDongle,
        DeviceCategory::UsbWireless,
        DeviceCategory::WirelessAudio,
        DeviceCategory::Other,
    ];
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCategory::Bluetooth => write!(f, "Bluetooth"),
            DeviceCategory::WifiAdapter => write!(f, "WiFi Adapter"),
            DeviceCategory::RfDongle => write!(f, "RF Dongle"),
            DeviceCategory::UsbWireless => write!(f, "USB Wireless"),
            DeviceCategory::WirelessAudio => write!(f, "Wireless Audio"),
            DeviceCategory::Other => write!(f, "Other"),
        }
    }
}

impl FromStr for DeviceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "bluetooth" | "bt" => Ok(DeviceCategory::Bluetooth),
            "wifi" | "wifiadapter" | "wlan" => Ok(DeviceCategory::WifiAdapter),
            "rf" | "rfdongle" | "dongle" => Ok(DeviceCategory::RfDongle),
            "usb" | "usbwireless" => Ok(DeviceCategory::UsbWireless),
            "audio" | "wirelessaudio" => Ok(DeviceCategory::WirelessAudio),
            "other" => Ok(DeviceCategory::Other),
            _ => Err(format!("unknown device category '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Enabled,
    Disabled,
    Unknown,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Enabled => write!(f, "enabled"),
            DeviceStatus::Disabled => write!(f, "disabled"),
            DeviceStatus::Unknown => write!(f, "unknown"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enabled" | "on" | "up" => Ok(DeviceStatus::Enabled),
            "disabled" | "off" | "down" => Ok(DeviceStatus::Disabled),
            "unknown" => Ok(DeviceStatus::Unknown),
            "error" => Ok(DeviceStatus::Error),
            _ => Err(format!("unknown device status '{}'", s)),
        }
    }
}

/// Where the current status value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusOrigin {
    /// Reported by a probe during a live cycle.
    #[default]
    Probed,
    /// Set after a successful management request, pending confirmation.
    Optimistic,
    /// Restored from the warm-start cache.
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CanEnable,
    CanDisable,
    InfoOnly,
}

/// Management capabilities of a device.
///
/// `InfoOnly` is present exactly when neither `CanEnable` nor `CanDisable` is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        let mut set: BTreeSet<Capability> = caps.into_iter().collect();
        if set.contains(&Capability::CanEnable) || set.contains(&Capability::CanDisable) {
            set.remove(&Capability::InfoOnly);
        } else {
            set.insert(Capability::InfoOnly);
        }
        Self(set)
    }

    pub fn info_only() -> Self {
        Self::new([])
    }

    pub fn toggle() -> Self {
        Self::new([Capability::CanEnable, Capability::CanDisable])
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn is_info_only(&self) -> bool {
        self.contains(Capability::InfoOnly)
    }

    pub fn allows(&self, action: ManagementAction) -> bool {
        self.contains(action.required_capability())
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::info_only()
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(caps: Vec<Capability>) -> Self {
        Self::new(caps)
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.0.into_iter().collect()
    }
}

/// Stable device identity derived from hardware address or path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalized hardware address of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareAddress {
    /// Colon separated, upper-case hex octets (`AA:BB:CC:DD:EE:FF`).
    Mac(String),
    /// Interface name, sysfs path or platform instance id.
    Path(String),
}

impl HardwareAddress {
    /// Normalize a backend-reported address; blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let groups: Vec<&str> = trimmed.split([':', '-']).collect();
        let is_mac = groups.len() >= 2
            && groups
                .iter()
                .all(|g| !g.is_empty() && g.len() <= 2 && g.chars().all(|c| c.is_ascii_hexdigit()));

        if is_mac {
            let octets: Vec<String> = groups
                .iter()
                .map(|g| format!("{:0>2}", g.to_uppercase()))
                .collect();
            Some(HardwareAddress::Mac(octets.join(":")))
        } else {
            Some(HardwareAddress::Path(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HardwareAddress::Mac(s) | HardwareAddress::Path(s) => s,
        }
    }

    fn id(&self) -> DeviceId {
        match self {
            HardwareAddress::Mac(mac) => DeviceId(format!("mac:{}", mac)),
            HardwareAddress::Path(path) => DeviceId(format!("path:{}", path)),
        }
    }
}

/// Canonical, deduplicated representation of one physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub category: DeviceCategory,
    pub name: String,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    /// Manufacturer from the USB vendor table or MAC OUI lookup
    pub vendor_name: Option<String>,
    pub address: Option<String>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub status_origin: StatusOrigin,
    pub capabilities: CapabilitySet,
    /// Probe responsible for managing this device
    pub backend: String,
    /// Every probe that reported the device in its latest cycle
    #[serde(default)]
    pub sources: Vec<String>,
    pub signal_strength: Option<i32>,
    pub battery_level: Option<u8>,
    pub last_seen: DateTime<Utc>,
    /// Raw payload per reporting probe, kept for diagnostics only
    #[serde(default)]
    pub raw: BTreeMap<String, RawFields>,
}

impl DeviceRecord {
    /// Compare observable state, ignoring bookkeeping that changes every cycle.
    pub fn same_state(&self, other: &DeviceRecord) -> bool {
        self.id == other.id
            && self.category == other.category
            && self.name == other.name
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.vendor_name == other.vendor_name
            && self.address == other.address
            && self.status == other.status
            && self.status_origin == other.status_origin
            && self.capabilities == other.capabilities
            && self.backend == other.backend
            && self.signal_strength == other.signal_strength
            && self.battery_level == other.battery_level
    }

    pub fn mac_address(&self) -> Option<&str> {
        self.id.as_str().strip_prefix("mac:")
    }

    pub fn is_manageable(&self) -> bool {
        !self.capabilities.is_info_only()
    }
}

/// A device as understood by one probe, before identity is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDraft {
    pub category: DeviceCategory,
    pub name: String,
    pub address: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub vendor_name: Option<String>,
    pub status: DeviceStatus,
    pub capabilities: CapabilitySet,
    pub signal_strength: Option<i32>,
    pub battery_level: Option<u8>,
}

impl DeviceDraft {
    pub fn new(category: DeviceCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
            address: None,
            vendor_id: None,
            product_id: None,
            vendor_name: None,
            status: DeviceStatus::Unknown,
            capabilities: CapabilitySet::info_only(),
            signal_strength: None,
            battery_level: None,
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn ids(mut self, vendor_id: Option<String>, product_id: Option<String>) -> Self {
        self.vendor_id = vendor_id.map(|v| v.trim().to_lowercase());
        self.product_id = product_id.map(|p| p.trim().to_lowercase());
        self
    }

    pub fn vendor_name(mut self, vendor: impl Into<String>) -> Self {
        self.vendor_name = Some(vendor.into());
        self
    }

    pub fn status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Assign identity and stamp the record for `probe`.
    pub fn into_record(
        self,
        probe: &str,
        raw: RawFields,
        observed_at: DateTime<Utc>,
    ) -> Result<DeviceRecord, NormalizationError> {
        let name = self.name.trim().to_string();
        let address = self.address.as_deref().and_then(HardwareAddress::parse);

        let id = match &address {
            Some(addr) => addr.id(),
            None => fallback_id(&self.vendor_id, &self.product_id, &name).ok_or_else(|| {
                NormalizationError::new(probe, "record has neither address, ids nor name")
            })?,
        };

        let name = if name.is_empty() {
            address
                .as_ref()
                .map(|a| format!("{} {}", self.category, a.as_str()))
                .unwrap_or_else(|| self.category.to_string())
        } else {
            name
        };

        let mut payloads = BTreeMap::new();
        payloads.insert(probe.to_string(), raw);

        Ok(DeviceRecord {
            id,
            category: self.category,
            name,
            vendor_id: self.vendor_id.filter(|v| !v.is_empty()),
            product_id: self.product_id.filter(|p| !p.is_empty()),
            vendor_name: self.vendor_name.filter(|v| !v.trim().is_empty()),
            address: address.map(|a| a.as_str().to_string()),
            status: self.status,
            status_origin: StatusOrigin::Probed,
            capabilities: self.capabilities,
            backend: probe.to_string(),
            sources: vec![probe.to_string()],
            signal_strength: self.signal_strength,
            battery_level: self.battery_level,
            last_seen: observed_at,
            raw: payloads,
        })
    }
}

fn fallback_id(vendor_id: &Option<String>, product_id: &Option<String>, name: &str) -> Option<DeviceId> {
    if name.is_empty() && vendor_id.is_none() && product_id.is_none() {
        return None;
    }
    Some(DeviceId(format!(
        "dev:{}:{}:{}",
        vendor_id.as_deref().unwrap_or("-"),
        product_id.as_deref().unwrap_or("-"),
        name
    )))
}

/// Classify a device from the words in its name.
pub fn classify_by_name(name: &str) -> Option<DeviceCategory> {
    let lower = name.to_lowercase();
    let has = |terms: &[&str]| terms.iter().any(|t| lower.contains(t));

    if has(&["receiver", "dongle", "unifying", "lightspeed"]) {
        Some(DeviceCategory::RfDongle)
    } else if has(&["wifi", "wi-fi", "wireless lan", "802.11", "wlan"]) {
        Some(DeviceCategory::WifiAdapter)
    } else if has(&["headset", "headphone", "earbud", "buds", "speaker", "audio", "airpods", "soundbar"]) {
        Some(DeviceCategory::WirelessAudio)
    } else if has(&["bluetooth"]) {
        Some(DeviceCategory::Bluetooth)
    } else {
        None
    }
}

/// Match a name against the keywords that mark a wireless device.
pub fn looks_wireless(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["wireless", "wifi", "wi-fi", "wlan", "802.11", "bluetooth", "dongle", "receiver", "unifying"]
        .iter()
        .any(|t| lower.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalization() {
        assert_eq!(
            HardwareAddress::parse("aa-bb-cc-dd-ee-ff"),
            Some(HardwareAddress::Mac("AA:BB:CC:DD:EE:FF".to_string()))
        );
        assert_eq!(
            HardwareAddress::parse(" AA:BB "),
            Some(HardwareAddress::Mac("AA:BB".to_string()))
        );
        assert_eq!(
            HardwareAddress::parse("a:b:c:d:e:f"),
            Some(HardwareAddress::Mac("0A:0B:0C:0D:0E:0F".to_string()))
        );
        assert_eq!(
            HardwareAddress::parse("wlan0"),
            Some(HardwareAddress::Path("wlan0".to_string()))
        );
        assert_eq!(HardwareAddress::parse("   "), None);
    }

    #[test]
    fn test_id_derivation_prefers_address() {
        let record = DeviceDraft::new(DeviceCategory::WirelessAudio, "HeadsetX")
            .address("aa:bb")
            .into_record("bluetooth", RawFields::new(), Utc::now())
            .unwrap();
        assert_eq!(record.id.as_str(), "mac:AA:BB");
        assert_eq!(record.address.as_deref(), Some("AA:BB"));
        assert_eq!(record.mac_address(), Some("AA:BB"));

        let renamed = DeviceDraft::new(DeviceCategory::WirelessAudio, "Renamed")
            .address("AA-BB")
            .into_record("usb", RawFields::new(), Utc::now())
            .unwrap();
        assert_eq!(record.id, renamed.id);
    }

    #[test]
    fn test_id_fallback_uses_ids_and_name() {
        let record = DeviceDraft::new(DeviceCategory::RfDongle, "Unifying Receiver")
            .ids(Some("046D".to_string()), Some("C52B".to_string()))
            .into_record("usb", RawFields::new(), Utc::now())
            .unwrap();
        assert_eq!(record.id.as_str(), "dev:046d:c52b:Unifying Receiver");
        assert_eq!(record.mac_address(), None);
    }

    #[test]
    fn test_empty_record_is_rejected() {
        let result = DeviceDraft::new(DeviceCategory::Other, "  ")
            .into_record("usb", RawFields::new(), Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_capability_set_invariant() {
        assert!(CapabilitySet::info_only().is_info_only());
        assert!(CapabilitySet::default().is_info_only());

        let caps = CapabilitySet::new([Capability::InfoOnly, Capability::CanDisable]);
        assert!(!caps.is_info_only());
        assert!(caps.allows(ManagementAction::Disable));
        assert!(!caps.allows(ManagementAction::Enable));

        let json = serde_json::to_string(&CapabilitySet::toggle()).unwrap();
        assert_eq!(json, r#"["can_enable","can_disable"]"#);
    }

    #[test]
    fn test_classify_by_name() {
        assert_eq!(
            classify_by_name("Logitech Unifying Receiver"),
            Some(DeviceCategory::RfDongle)
        );
        assert_eq!(
            classify_by_name("Realtek 802.11ac WLAN Adapter"),
            Some(DeviceCategory::WifiAdapter)
        );
        assert_eq!(
            classify_by_name("WH-1000XM4 Headset"),
            Some(DeviceCategory::WirelessAudio)
        );
        assert_eq!(
            classify_by_name("Intel Bluetooth"),
            Some(DeviceCategory::Bluetooth)
        );
        assert_eq!(classify_by_name("Mass Storage"), None);
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("wifi".parse::<DeviceCategory>(), Ok(DeviceCategory::WifiAdapter));
        assert_eq!(
            "wireless_audio".parse::<DeviceCategory>(),
            Ok(DeviceCategory::WirelessAudio)
        );
        assert!("toaster".parse::<DeviceCategory>().is_err());
        assert_eq!("Enabled".parse::<DeviceStatus>(), Ok(DeviceStatus::Enabled));
    }
}
