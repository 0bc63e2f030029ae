//! Host resource figures shown next to the device list.
//!
//! Read-only and independent of detection: nothing here touches the registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    pub percent: u8,
    /// `None` when the platform does not say
    pub plugged: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub platform: String,
    pub os_version: Option<String>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub battery: Option<BatteryStatus>,
    pub collected_at: DateTime<Utc>,
}

/// Source of host statistics. Implementations may block.
pub trait SystemMonitor: Send + Sync {
    fn collect(&self) -> SystemStats;
}

/// `sysinfo` for CPU and memory, platform tools for the battery.
pub struct HostMonitor {
    system: Mutex<System>,
}

impl HostMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; take the first one now
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor for HostMonitor {
    fn collect(&self) -> SystemStats {
        let (cpu_percent, memory_used_bytes, memory_total_bytes) = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            system.refresh_cpu();
            system.refresh_memory();
            (
                system.global_cpu_info().cpu_usage(),
                system.used_memory(),
                system.total_memory(),
            )
        };

        SystemStats {
            platform: std::env::consts::OS.to_string(),
            os_version: System::long_os_version(),
            cpu_percent,
            memory_percent: memory_percent(memory_used_bytes, memory_total_bytes),
            memory_used_bytes,
            memory_total_bytes,
            battery: read_battery(),
            collected_at: Utc::now(),
        }
    }
}

fn memory_percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

fn read_battery() -> Option<BatteryStatus> {
    #[cfg(target_os = "linux")]
    {
        read_power_supply(Path::new("/sys/class/power_supply"))
    }

    #[cfg(target_os = "macos")]
    {
        crate::probe::command::run("pmset", &["-g", "batt"])
            .ok()
            .and_then(|output| parse_pmset(&output))
    }

    #[cfg(target_os = "windows")]
    {
        crate::probe::command::run(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_Battery | ForEach-Object { \"$($_.EstimatedChargeRemaining)|$($_.BatteryStatus)\" }",
            ],
        )
        .ok()
        .and_then(|output| parse_win32_battery(&output))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

/// First `type == Battery` supply under a sysfs `power_supply` directory.
pub fn read_power_supply(root: &Path) -> Option<BatteryStatus> {
    let mut entries: Vec<_> = std::fs::read_dir(root).ok()?.flatten().map(|e| e.path()).collect();
    entries.sort();

    let read = |dir: &Path, file: &str| std::fs::read_to_string(dir.join(file)).ok().map(|s| s.trim().to_string());

    let mains_online = entries
        .iter()
        .filter(|dir| read(dir, "type").as_deref() == Some("Mains"))
        .find_map(|dir| read(dir, "online"))
        .map(|online| online == "1");

    entries.iter().find_map(|dir| {
        if read(dir, "type").as_deref() != Some("Battery") {
            return None;
        }
        let percent: u8 = read(dir, "capacity")?.parse().ok()?;
        let plugged = mains_online.or_else(|| {
            read(dir, "status").map(|status| status != "Discharging")
        });
        Some(BatteryStatus {
            percent: percent.min(100),
            plugged,
        })
    })
}

/// Parse `pmset -g batt`.
///
/// ```text
/// Now drawing from 'AC Power'
///  -InternalBattery-0 (id=4653155)	95%; charged; 0:00 remaining present: true
/// ```
pub fn parse_pmset(output: &str) -> Option<BatteryStatus> {
    let plugged = output
        .lines()
        .next()
        .map(|first| first.contains("AC Power"));

    let line = output.lines().find(|l| l.contains("InternalBattery"))?;
    let percent_end = line.find('%')?;
    let digits: String = line[..percent_end]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let percent: u8 = digits.parse().ok()?;

    Some(BatteryStatus {
        percent: percent.min(100),
        plugged,
    })
}

/// Parse `EstimatedChargeRemaining|BatteryStatus` lines. Status 2, 3 and 6
/// mean mains power.
pub fn parse_win32_battery(output: &str) -> Option<BatteryStatus> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (charge, status) = line.split_once('|')?;
    let percent: u8 = charge.trim().parse().ok()?;
    let plugged = status.trim().parse::<u16>().ok().map(|s| matches!(s, 2 | 3 | 6));
    Some(BatteryStatus {
        percent: percent.min(100),
        plugged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            std::fs::write(dir.join(file), format!("{}\n", content)).unwrap();
        }
    }

    #[test]
    fn test_read_power_supply() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        supply(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("capacity", "57"), ("status", "Discharging")],
        );

        let battery = read_power_supply(root.path()).unwrap();
        assert_eq!(battery.percent, 57);
        assert_eq!(battery.plugged, Some(false));
    }

    #[test]
    fn test_power_supply_without_battery() {
        let root = tempfile::tempdir().unwrap();
        supply(root.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        assert_eq!(read_power_supply(root.path()), None);
        assert_eq!(read_power_supply(&root.path().join("missing")), None);
    }

    #[test]
    fn test_parse_pmset() {
        let output = "Now drawing from 'AC Power'\n -InternalBattery-0 (id=4653155)\t95%; charged; 0:00 remaining present: true\n";
        assert_eq!(
            parse_pmset(output),
            Some(BatteryStatus {
                percent: 95,
                plugged: Some(true)
            })
        );

        let output = "Now drawing from 'Battery Power'\n -InternalBattery-0 (id=1)\t7%; discharging; 0:20 remaining present: true\n";
        assert_eq!(parse_pmset(output).map(|b| (b.percent, b.plugged)), Some((7, Some(false))));

        assert_eq!(parse_pmset("Now drawing from 'AC Power'\n"), None);
    }

    #[test]
    fn test_parse_win32_battery() {
        assert_eq!(
            parse_win32_battery("\r\n88|2\r\n"),
            Some(BatteryStatus {
                percent: 88,
                plugged: Some(true)
            })
        );
        assert_eq!(parse_win32_battery("40|1").and_then(|b| b.plugged), Some(false));
        assert_eq!(parse_win32_battery(""), None);
    }

    #[test]
    fn test_memory_percent() {
        assert_eq!(memory_percent(0, 0), 0.0);
        assert_eq!(memory_percent(50, 200), 25.0);
    }
}
