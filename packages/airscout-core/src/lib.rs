//! Airscout Core Library
//!
//! This crate provides the core functionality for Airscout agents:
//! - Wireless device detection (network interfaces, rfkill, Bluetooth, USB)
//! - Reconciliation into a single device registry with snapshots and diffs
//! - Enable/disable management through the owning platform probe
//! - Host statistics (CPU, memory, battery)
//!
//! # Example
//!
//! ```no_run
//! use airscout_core::{load_agent_config, Coordinator, DeviceFilter, ManagementAction};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = Coordinator::from_config(load_agent_config());
//!     coordinator.warm_start().await;
//!
//!     // One detection cycle
//!     coordinator.scan_now(&CancellationToken::new()).await;
//!
//!     for device in coordinator.view(&DeviceFilter::new().manageable()) {
//!         println!("{} {}", device.id, device.name);
//!         let result = coordinator.request(&device.id, ManagementAction::Disable).await;
//!         println!("{}", result.outcome);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod oui;
pub mod pipeline;
pub mod privileges;
pub mod probe;
pub mod registry;
pub mod snapshot;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{load_agent_config, AgentConfig, ConfigSource};
pub use coordinator::{Coordinator, CycleSummary, ProbeStatus};
pub use device::{Capability, CapabilitySet, DeviceCategory, DeviceId, DeviceRecord, DeviceStatus, StatusOrigin};
pub use error::{ManagementError, NormalizationError, ProbeError};
pub use manager::{ManagementAction, ManagementOutcome, ManagementResult};
pub use monitor::{BatteryStatus, HostMonitor, SystemMonitor, SystemStats};
pub use pipeline::{CycleReport, ProbeOutcome, ProbeReport};
pub use registry::{ReconcileReport, RegistryEvent};
pub use snapshot::{DeviceFilter, DeviceStatistics, RegistryDiff, RegistrySnapshot};
