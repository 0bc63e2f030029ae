//! Privilege detection for management actions.
//!
//! Listing devices works unprivileged everywhere. Toggling them does not:
//! - Linux: `ip link set` needs CAP_NET_ADMIN, `rfkill` needs write access to /dev/rfkill
//! - macOS: `networksetup -setairportpower` may prompt for an administrator
//! - Windows: `netsh interface set` and `Disable-PnpDevice` need an elevated shell

/// Check if the current process is running with elevated privileges
pub fn is_elevated() -> bool {
    #[cfg(target_os = "windows")]
    {
        is_elevated_windows()
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        false
    }
}

#[cfg(target_os = "windows")]
fn is_elevated_windows() -> bool {
    match crate::probe::command::run("whoami", &["/groups"]) {
        Ok(output) => output.contains("S-1-16-12288") || output.contains("High Mandatory Level"),
        Err(_) => false,
    }
}

/// Platform-specific instructions for running management actions elevated
pub fn elevation_instructions() -> String {
    #[cfg(target_os = "windows")]
    {
        "To enable or disable devices on Windows:\n\
         1. Open a terminal with 'Run as administrator'\n\
         2. Run the airscout command again"
            .to_string()
    }

    #[cfg(target_os = "linux")]
    {
        "To enable or disable devices on Linux:\n\
         \n\
         Option 1 - Run as root:\n\
         $ sudo airscout <enable|disable> <device-id>\n\
         \n\
         Option 2 - Grant CAP_NET_ADMIN for network interfaces and rfkill:\n\
         $ sudo setcap cap_net_admin+ep $(which airscout)\n\
         \n\
         Bluetooth power changes go through BlueZ and usually work for\n\
         users in the 'bluetooth' group."
            .to_string()
    }

    #[cfg(target_os = "macos")]
    {
        "To enable or disable devices on macOS:\n\
         $ sudo airscout <enable|disable> <device-id>\n\
         \n\
         Wi-Fi power changes may also require an administrator account."
            .to_string()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        "Elevated privileges may be required to manage devices.\n\
         Please consult your operating system documentation."
            .to_string()
    }
}

/// Append elevation guidance to a permission failure message.
pub fn with_elevation_hint(message: &str) -> String {
    if is_elevated() {
        format!(
            "{}\n\nThe process is already elevated; the platform refused the change.",
            message
        )
    } else {
        format!("{}\n\n{}", message, elevation_instructions())
    }
}
