//! Error taxonomy for detection and management.
//!
//! Detection-side errors ([`ProbeError`], [`NormalizationError`]) are contained
//! at their origin and only surface through logs and the cycle report.
//! [`ManagementError`] maps one-to-one onto the outcome returned to callers.

use crate::manager::ManagementOutcome;

/// Errors raised by a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// The underlying tool or API is not present on this host.
    #[error("Probe unavailable: {probe} ({reason})")]
    Unavailable { probe: String, reason: String },

    /// The mechanism is present but the invocation failed.
    #[error("Probe {probe} failed: {message}")]
    Execution { probe: String, message: String },

    /// The invocation did not finish within its time budget.
    #[error("Probe {probe} timed out after {timeout_ms}ms")]
    Timeout { probe: String, timeout_ms: u64 },
}

impl ProbeError {
    pub fn unavailable(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            probe: probe.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(probe: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            probe: probe.into(),
            message: message.into(),
        }
    }

    pub fn timeout(probe: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            probe: probe.into(),
            timeout_ms,
        }
    }

    /// Timeouts count as execution errors; only `Unavailable` is silent.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// One raw record could not be turned into a canonical device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed {probe} record: {reason}")]
pub struct NormalizationError {
    pub probe: String,
    pub reason: String,
}

impl NormalizationError {
    pub fn new(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of an enable/disable request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagementError {
    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Timeout(String),
}

impl ManagementError {
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn outcome(&self) -> ManagementOutcome {
        match self {
            Self::Unsupported(_) => ManagementOutcome::Unsupported,
            Self::PermissionDenied(_) => ManagementOutcome::PermissionDenied,
            Self::Failed(_) => ManagementOutcome::Failed,
            Self::Timeout(_) => ManagementOutcome::Timeout,
        }
    }
}
