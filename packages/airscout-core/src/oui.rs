//! MAC OUI vendor lookup against the IEEE registry bundled by `oui-data`.

use crate::device::DeviceCategory;

/// Manufacturer registered for the first three octets of `mac`.
///
/// Locally administered (randomized) addresses carry no OUI and yield `None`.
pub fn lookup_vendor(mac: &str) -> Option<String> {
    let normalized = normalize_mac(mac)?;
    if is_locally_administered(&normalized) {
        tracing::trace!("OUI lookup for {}: locally administered, skipped", mac);
        return None;
    }

    let record = oui_data::lookup(&normalized)?;
    let vendor = record.organization().to_string();
    tracing::debug!("OUI lookup for {}: {}", mac, vendor);
    Some(vendor)
}

/// `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff` and friends to `AA:BB:CC:DD:EE:FF`.
///
/// Requires a full six-octet address.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let cleaned: String = mac.replace([':', '-', '.'], "").to_uppercase();
    if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let octets: Vec<&str> = (0..6).filter_map(|i| cleaned.get(i * 2..i * 2 + 2)).collect();
    Some(octets.join(":"))
}

/// Second-least-significant bit of the first octet.
pub fn is_locally_administered(mac: &str) -> bool {
    mac.get(0..2)
        .and_then(|octet| u8::from_str_radix(octet, 16).ok())
        .map(|octet| octet & 0x02 != 0)
        .unwrap_or(false)
}

/// Category suggested by the manufacturer, for devices that report a
/// generic name.
pub fn infer_category(vendor: &str) -> Option<DeviceCategory> {
    let vendor = vendor.to_lowercase();

    const AUDIO: &[&str] = &[
        "bose",
        "jabra",
        "gn audio",
        "sennheiser",
        "harman",
        "jbl",
        "plantronics",
        "skullcandy",
        "beats",
        "bang & olufsen",
        "audio-technica",
        "sonos",
        "anker",
    ];
    if AUDIO.iter().any(|v| vendor.contains(v)) {
        return Some(DeviceCategory::WirelessAudio);
    }

    None
}
