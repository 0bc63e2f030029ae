//! Running platform tools for probes and management hooks.

use crate::error::{ManagementError, ProbeError};
use std::io::ErrorKind;
use std::process::Command;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that hides the console window on Windows.
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Failure modes of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The program is not installed.
    NotFound { program: String },
    /// The program refused to run for lack of privileges.
    PermissionDenied { program: String, message: String },
    /// The program ran and exited unsuccessfully.
    Failed { program: String, message: String },
}

impl CommandError {
    pub fn into_probe_error(self, probe: &str) -> ProbeError {
        match self {
            CommandError::NotFound { program } => {
                ProbeError::unavailable(probe, format!("{} is not installed", program))
            }
            CommandError::PermissionDenied { program, message } => {
                ProbeError::execution(probe, format!("{}: {}", program, message))
            }
            CommandError::Failed { program, message } => {
                ProbeError::execution(probe, format!("{}: {}", program, message))
            }
        }
    }

    pub fn into_management_error(self) -> ManagementError {
        match self {
            CommandError::NotFound { program } => {
                ManagementError::failed(format!("{} is not installed", program))
            }
            CommandError::PermissionDenied { program, message } => {
                ManagementError::permission_denied(format!(
                    "{} requires elevated privileges: {}",
                    program, message
                ))
            }
            CommandError::Failed { program, message } => {
                ManagementError::failed(format!("{} failed: {}", program, message))
            }
        }
    }
}

/// Run `program` with `args` and return its stdout.
///
/// Callers run this on the blocking pool; the timeout is applied around it.
pub fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let output = match hidden_command(program).args(args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(CommandError::NotFound {
                program: program.to_string(),
            });
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(CommandError::PermissionDenied {
                program: program.to_string(),
                message: e.to_string(),
            });
        }
        Err(e) => {
            return Err(CommandError::Failed {
                program: program.to_string(),
                message: e.to_string(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        match output.status.code() {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    } else {
        stderr
    };

    if is_permission_error(&message) || is_permission_error(&stdout) {
        Err(CommandError::PermissionDenied {
            program: program.to_string(),
            message,
        })
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            message,
        })
    }
}

/// Recognize the privilege failures the supported tools print.
pub fn is_permission_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    [
        "permission denied",
        "operation not permitted",
        "access is denied",
        "requires elevation",
        "not authorized",
        "eacces",
        "eperm",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// Whether `program` can be found on PATH.
pub fn is_installed(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_markers() {
        assert!(is_permission_error("RTNETLINK answers: Operation not permitted"));
        assert!(is_permission_error("Can't open RFKILL control device: Permission denied"));
        assert!(is_permission_error("The requested operation requires elevation (Run as administrator)."));
        assert!(!is_permission_error("No such device"));
    }

    #[test]
    fn test_missing_program_is_not_found() {
        let result = run("airscout-definitely-not-a-real-tool", &[]);
        assert!(matches!(result, Err(CommandError::NotFound { .. })));
        assert!(!is_installed("airscout-definitely-not-a-real-tool"));
    }

    #[test]
    fn test_error_mapping() {
        let err = CommandError::NotFound {
            program: "lsusb".to_string(),
        };
        assert!(err.clone().into_probe_error("usb").is_unavailable());
        assert_eq!(
            err.into_management_error(),
            ManagementError::failed("lsusb is not installed")
        );

        let err = CommandError::PermissionDenied {
            program: "ip".to_string(),
            message: "Operation not permitted".to_string(),
        };
        assert!(matches!(
            err.into_management_error(),
            ManagementError::PermissionDenied(_)
        ));
    }
}
