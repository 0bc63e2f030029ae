use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MISS_THRESHOLD: u32 = 2;

const ENV_SCAN_INTERVAL: &str = "AIRSCOUT_SCAN_INTERVAL";
const ENV_PROBE_TIMEOUT: &str = "AIRSCOUT_PROBE_TIMEOUT";
const ENV_MISS_THRESHOLD: &str = "AIRSCOUT_MISS_THRESHOLD";
const ENV_CACHE: &str = "AIRSCOUT_CACHE";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    scan: Option<ScanSection>,
    management: Option<ManagementSection>,
    probes: Option<ProbesSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ScanSection {
    interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    miss_threshold: Option<u32>,
    warm_start_cache: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ManagementSection {
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbesSection {
    disabled: Option<Vec<String>>,
}

/// Runtime agent configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Seconds between background scan cycles
    pub scan_interval_secs: u64,
    /// Time budget for one probe's `list()` call
    pub probe_timeout_secs: u64,
    /// Time budget for one management command
    pub command_timeout_secs: u64,
    /// Consecutive missed cycles tolerated before a device is removed
    pub miss_threshold: u32,
    pub warm_start_cache: bool,
    /// Probe names that are never registered
    pub disabled_probes: Vec<String>,
    /// Most specific source that contributed a value
    pub source: ConfigSource,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            warm_start_cache: true,
            disabled_probes: Vec::new(),
            source: ConfigSource::Default,
        }
    }
}

impl AgentConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Merge a parsed config file and environment lookups over the defaults.
    ///
    /// Environment values win over file values field by field. Values that
    /// fail validation are logged and ignored.
    pub fn from_sources(file: Option<ConfigFile>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = AgentConfig::default();

        if let Some(file) = file {
            config.source = ConfigSource::ConfigFile;
            let scan = file.scan.unwrap_or_default();
            if let Some(v) = scan.interval_secs.and_then(|v| positive("scan.interval_secs", v)) {
                config.scan_interval_secs = v;
            }
            if let Some(v) = scan.probe_timeout_secs.and_then(|v| positive("scan.probe_timeout_secs", v)) {
                config.probe_timeout_secs = v;
            }
            if let Some(v) = scan.miss_threshold {
                config.miss_threshold = v;
            }
            if let Some(v) = scan.warm_start_cache {
                config.warm_start_cache = v;
            }
            if let Some(v) = file
                .management
                .and_then(|m| m.command_timeout_secs)
                .and_then(|v| positive("management.command_timeout_secs", v))
            {
                config.command_timeout_secs = v;
            }
            if let Some(disabled) = file.probes.and_then(|p| p.disabled) {
                config.disabled_probes = disabled
                    .into_iter()
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
        }

        let mut from_env = false;
        if let Some(v) = env_u64(&env, ENV_SCAN_INTERVAL).and_then(|v| positive(ENV_SCAN_INTERVAL, v)) {
            config.scan_interval_secs = v;
            from_env = true;
        }
        if let Some(v) = env_u64(&env, ENV_PROBE_TIMEOUT).and_then(|v| positive(ENV_PROBE_TIMEOUT, v)) {
            config.probe_timeout_secs = v;
            from_env = true;
        }
        if let Some(v) = env_u64(&env, ENV_MISS_THRESHOLD) {
            config.miss_threshold = v.min(u32::MAX as u64) as u32;
            from_env = true;
        }
        if let Some(raw) = env(ENV_CACHE) {
            match parse_bool(&raw) {
                Some(v) => {
                    config.warm_start_cache = v;
                    from_env = true;
                }
                None => tracing::warn!("Ignoring invalid {}={:?}", ENV_CACHE, raw),
            }
        }
        if from_env {
            config.source = ConfigSource::Environment;
        }

        if config.miss_threshold == 0 {
            tracing::warn!("miss_threshold must be at least 1, using 1");
            config.miss_threshold = 1;
        }

        config
    }
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// At least one value from an environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

fn positive(field: &str, value: u64) -> Option<u64> {
    if value == 0 {
        tracing::warn!("Ignoring {} = 0, value must be positive", field);
        None
    } else {
        Some(value)
    }
}

fn env_u64(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get the path to the configuration file
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("airscout").join("config.toml"))
}

/// Parse a config file at `path`.
pub fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Load agent configuration with priority:
/// 1. Environment variables (AIRSCOUT_*)
/// 2. Config file (~/.config/airscout/config.toml)
/// 3. Default values
pub fn load_agent_config() -> AgentConfig {
    let file = config_file_path()
        .filter(|path| path.exists())
        .and_then(|path| match read_config_file(&path) {
            Ok(file) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(file)
            }
            Err(e) => {
                tracing::warn!("{:#}", e);
                None
            }
        });

    let config = AgentConfig::from_sources(file, |key| std::env::var(key).ok());
    tracing::debug!("Effective configuration from {}: {:?}", config.source, config);
    config
}

/// Get the path to the config file for documentation purposes
pub fn config_file_path_string() -> String {
    config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/airscout/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# airscout configuration
# Place this file at: ~/.config/airscout/config.toml

[scan]
# Seconds between background scan cycles (env: AIRSCOUT_SCAN_INTERVAL)
# interval_secs = 30

# Time budget for each probe per cycle (env: AIRSCOUT_PROBE_TIMEOUT)
# probe_timeout_secs = 10

# Consecutive missed cycles tolerated before a device is dropped
# (env: AIRSCOUT_MISS_THRESHOLD)
# miss_threshold = 2

# Paint the last known devices at startup (env: AIRSCOUT_CACHE)
# warm_start_cache = true

[management]
# command_timeout_secs = 10

[probes]
# Probes to leave unregistered: bluetooth, network, rfkill, usb
# disabled = ["rfkill"]
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_sources(None, env_from(&[]));
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.source, ConfigSource::Default);
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_file_then_env_priority() {
        let file: ConfigFile = toml::from_str(
            r#"
[scan]
interval_secs = 60
miss_threshold = 4
warm_start_cache = false

[management]
command_timeout_secs = 5

[probes]
disabled = ["RFKill", " "]
"#,
        )
        .unwrap();

        let config = AgentConfig::from_sources(Some(file), env_from(&[(ENV_SCAN_INTERVAL, "15")]));
        assert_eq!(config.scan_interval_secs, 15);
        assert_eq!(config.miss_threshold, 4);
        assert!(!config.warm_start_cache);
        assert_eq!(config.command_timeout_secs, 5);
        assert_eq!(config.disabled_probes, vec!["rfkill".to_string()]);
        assert_eq!(config.source, ConfigSource::Environment);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = AgentConfig::from_sources(
            None,
            env_from(&[
                (ENV_PROBE_TIMEOUT, "soon"),
                (ENV_SCAN_INTERVAL, "0"),
                (ENV_CACHE, "maybe"),
                (ENV_MISS_THRESHOLD, "0"),
            ]),
        );
        assert_eq!(config.probe_timeout_secs, DEFAULT_PROBE_TIMEOUT_SECS);
        assert_eq!(config.scan_interval_secs, DEFAULT_SCAN_INTERVAL_SECS);
        assert!(config.warm_start_cache);
        assert_eq!(config.miss_threshold, 1);
    }

    #[test]
    fn test_read_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, generate_example_config()).unwrap();
        assert!(read_config_file(&path).is_ok());

        std::fs::write(&path, "[scan\ninterval_secs = ").unwrap();
        let err = read_config_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
