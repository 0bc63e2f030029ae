//! Enable/disable requests against registered devices.

use crate::device::{Capability, DeviceId, DeviceRecord, DeviceStatus, StatusOrigin};
use crate::error::ManagementError;
use crate::privileges;
use crate::probe::ProbeTable;
use crate::registry::SharedRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementAction {
    Enable,
    Disable,
}

impl ManagementAction {
    pub fn target_status(self) -> DeviceStatus {
        match self {
            ManagementAction::Enable => DeviceStatus::Enabled,
            ManagementAction::Disable => DeviceStatus::Disabled,
        }
    }

    pub fn required_capability(self) -> Capability {
        match self {
            ManagementAction::Enable => Capability::CanEnable,
            ManagementAction::Disable => Capability::CanDisable,
        }
    }
}

impl fmt::Display for ManagementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementAction::Enable => write!(f, "enable"),
            ManagementAction::Disable => write!(f, "disable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementOutcome {
    Success,
    Unsupported,
    PermissionDenied,
    Failed,
    Timeout,
}

impl fmt::Display for ManagementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementOutcome::Success => write!(f, "success"),
            ManagementOutcome::Unsupported => write!(f, "unsupported"),
            ManagementOutcome::PermissionDenied => write!(f, "permission denied"),
            ManagementOutcome::Failed => write!(f, "failed"),
            ManagementOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementResult {
    pub device_id: DeviceId,
    pub action: ManagementAction,
    pub outcome: ManagementOutcome,
    pub message: String,
}

impl ManagementResult {
    fn success(device_id: &DeviceId, action: ManagementAction, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.clone(),
            action,
            outcome: ManagementOutcome::Success,
            message: message.into(),
        }
    }

    fn from_error(device_id: &DeviceId, action: ManagementAction, error: ManagementError) -> Self {
        Self {
            device_id: device_id.clone(),
            action,
            outcome: error.outcome(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ManagementOutcome::Success
    }
}

/// Marks a device as having a request in flight until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<DeviceId>>,
    id: DeviceId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<DeviceId>>, id: &DeviceId) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(id.clone()) {
            return None;
        }
        Some(Self { set, id: id.clone() })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.id);
    }
}

/// Dispatches management requests to the probe that owns each device.
pub struct ManagementExecutor {
    registry: Arc<SharedRegistry>,
    probes: Arc<ProbeTable>,
    command_timeout: Duration,
    in_flight: Mutex<HashSet<DeviceId>>,
}

impl ManagementExecutor {
    pub fn new(registry: Arc<SharedRegistry>, probes: Arc<ProbeTable>, command_timeout: Duration) -> Self {
        Self {
            registry,
            probes,
            command_timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Validate, dispatch and record one request. Never panics on backend
    /// failure; every failure is a typed outcome.
    pub async fn request(&self, id: &DeviceId, action: ManagementAction) -> ManagementResult {
        let result = match self.execute(id, action).await {
            Ok(message) => ManagementResult::success(id, action, message),
            Err(error) => ManagementResult::from_error(id, action, error),
        };

        match result.outcome {
            ManagementOutcome::Success => {
                tracing::info!("{} {}: {}", action, id, result.message)
            }
            ManagementOutcome::Unsupported => {
                tracing::info!("{} {} unsupported: {}", action, id, result.message)
            }
            _ => tracing::warn!("{} {} {}: {}", action, id, result.outcome, result.message),
        }

        result
    }

    async fn execute(&self, id: &DeviceId, action: ManagementAction) -> Result<String, ManagementError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| ManagementError::unsupported(format!("Device {} is not known", id)))?;

        check_capability(&record, action)?;

        // Cached records carry no backend payload and an unverified status
        if record.status_origin == StatusOrigin::Cached {
            return Err(ManagementError::failed(format!(
                "{} is awaiting the first scan; try again once detection completes",
                record.name
            )));
        }

        if record.status == action.target_status() {
            return Ok(format!("{} is already {}", record.name, record.status));
        }

        let _guard = InFlight::acquire(&self.in_flight, id).ok_or_else(|| {
            ManagementError::failed(format!(
                "A request for {} is already in progress",
                record.name
            ))
        })?;

        // The record may have been reconciled away while we waited
        let record = self.registry.get(id).ok_or_else(|| {
            ManagementError::failed(format!("{} disappeared before the request was sent", record.name))
        })?;

        let probe = self.probes.get(&record.backend).ok_or_else(|| {
            ManagementError::failed(format!(
                "Backend '{}' for {} is no longer registered",
                record.backend, record.name
            ))
        })?;

        tracing::debug!("Dispatching {} for {} to {}", action, id, probe.name());
        let name = record.name.clone();
        let task = spawn_blocking(move || probe.apply(&record, action));

        match timeout(self.command_timeout, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(ManagementError::PermissionDenied(message)))) => {
                return Err(ManagementError::permission_denied(privileges::with_elevation_hint(
                    &message,
                )));
            }
            Ok(Ok(Err(error))) => return Err(error),
            Ok(Err(join_error)) => {
                return Err(ManagementError::failed(format!(
                    "Management task for {} failed: {}",
                    name, join_error
                )));
            }
            Err(_) => {
                return Err(ManagementError::timeout(format!(
                    "{} of {} did not finish within {}s",
                    action,
                    name,
                    self.command_timeout.as_secs_f32()
                )));
            }
        }

        let target = action.target_status();
        if !self.registry.patch_status(id, target).await {
            tracing::warn!("{} vanished after a successful {}; status not recorded", id, action);
        }

        Ok(format!("{} is now {}", name, target))
    }
}

fn check_capability(record: &DeviceRecord, action: ManagementAction) -> Result<(), ManagementError> {
    if record.capabilities.is_info_only() {
        return Err(ManagementError::unsupported(format!(
            "{} has no management support (information only)",
            record.name
        )));
    }
    if !record.capabilities.allows(action) {
        return Err(ManagementError::unsupported(format!(
            "{} cannot be {}d through {}",
            record.name, action, record.backend
        )));
    }
    Ok(())
}
