//! Airscout CLI - inspect and manage wireless devices from the terminal
//!
//! This binary can:
//! - Run a detection cycle and list wireless devices
//! - Enable or disable a manageable device
//! - Show probe availability and host statistics
//! - Watch the registry for changes until interrupted

mod watch;

use airscout_core::config::{config_file_path_string, generate_example_config};
use airscout_core::pipeline::ProbeOutcome;
use airscout_core::{
    load_agent_config, privileges, Coordinator, DeviceCategory, DeviceFilter, DeviceId, DeviceRecord,
    DeviceStatus, ManagementAction,
};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "airscout")]
#[command(author = "Airscout Team")]
#[command(version)]
#[command(about = "Detect and manage wireless devices")]
#[command(long_about = "
Airscout finds the wireless hardware attached to this machine (WiFi
adapters, Bluetooth controllers and peripherals, RF dongles, USB
wireless devices) and lets you switch manageable ones on and off.

Quick start:
  1. List devices:     airscout scan
  2. Turn one off:     airscout disable mac:AA:BB:CC:DD:EE:FF
  3. Follow changes:   airscout watch

Turning radios on and off usually needs elevated privileges.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a detection cycle and list devices
    #[command(alias = "list")]
    Scan {
        /// Only show these categories (bluetooth, wifi, rf, usb, audio, other)
        #[arg(short, long)]
        category: Vec<DeviceCategory>,

        /// Only show devices in these states (enabled, disabled, unknown, error)
        #[arg(short, long)]
        status: Vec<DeviceStatus>,

        /// Only show devices that can be enabled or disabled
        #[arg(short, long)]
        manageable: bool,
    },

    /// Enable a device by id
    Enable {
        /// Device id as printed by `airscout scan`
        id: String,
    },

    /// Disable a device by id
    Disable {
        /// Device id as printed by `airscout scan`
        id: String,
    },

    /// Show which detection probes are usable on this machine
    Probes,

    /// Show host and device statistics and privilege level
    Status,

    /// Scan continuously and print registry changes
    Watch {
        /// Scan interval in seconds (overrides configuration)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("airscout={},airscout_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Scan {
            category,
            status,
            manageable,
        } => {
            let filter = build_filter(category, status, *manageable);
            cmd_scan(&cli, &filter).await
        }
        Commands::Enable { id } => cmd_manage(&cli, id, ManagementAction::Enable).await,
        Commands::Disable { id } => cmd_manage(&cli, id, ManagementAction::Disable).await,
        Commands::Probes => cmd_probes(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Watch { interval } => watch::run_watch(cli.format, *interval).await,
        Commands::Config => cmd_config(&cli).await,
    }
}

fn build_filter(categories: &[DeviceCategory], statuses: &[DeviceStatus], manageable: bool) -> DeviceFilter {
    let mut filter = categories
        .iter()
        .fold(DeviceFilter::new(), |filter, c| filter.category(*c));
    filter = statuses.iter().fold(filter, |filter, s| filter.status(*s));
    if manageable {
        filter = filter.manageable();
    }
    filter
}

/// One aligned line per device for text output.
pub(crate) fn format_device(device: &DeviceRecord) -> String {
    let mut line = format!(
        "  {:<28} {:<14} {:<9} {}",
        device.id.as_str(),
        device.category.to_string(),
        device.status.to_string(),
        device.name
    );
    if let Some(vendor) = &device.vendor_name {
        line.push_str(&format!(" ({})", vendor));
    }
    if !device.is_manageable() {
        line.push_str(" [info only]");
    }
    line
}

async fn cmd_scan(cli: &Cli, filter: &DeviceFilter) -> Result<()> {
    let coordinator = Coordinator::from_config(load_agent_config());

    match cli.format {
        OutputFormat::Text => println!("Scanning for wireless devices..."),
        OutputFormat::Json => {}
    }

    let summary = coordinator.scan_now(&CancellationToken::new()).await;
    let devices = coordinator.view(filter);

    match cli.format {
        OutputFormat::Text => {
            if let Some(summary) = &summary {
                for probe in &summary.report.probes {
                    match &probe.outcome {
                        ProbeOutcome::Failed { message } => {
                            eprintln!("  warning: {} probe failed: {}", probe.probe, message);
                        }
                        ProbeOutcome::TimedOut { timeout_ms } => {
                            eprintln!("  warning: {} probe timed out after {}ms", probe.probe, timeout_ms);
                        }
                        _ => {}
                    }
                }
            }

            println!();
            println!("Found {} devices:", devices.len());
            println!();
            for device in &devices {
                println!("{}", format_device(device));
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "devices": devices,
                    "report": summary.as_ref().map(|s| &s.report),
                    "statistics": coordinator.snapshot().statistics(),
                })
            );
        }
    }

    Ok(())
}

async fn cmd_manage(cli: &Cli, id: &str, action: ManagementAction) -> Result<()> {
    let coordinator = Coordinator::from_config(load_agent_config());

    // The registry lives in this process; populate it before acting
    coordinator.scan_now(&CancellationToken::new()).await;

    let result = coordinator.request(&DeviceId::from(id), action).await;

    match cli.format {
        OutputFormat::Text => {
            if result.is_success() {
                println!("{}: {} ({})", result.device_id, result.outcome, result.message);
            } else {
                eprintln!("Could not {} {}: {}", action, result.device_id, result.outcome);
                eprintln!("{}", result.message);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_probes(cli: &Cli) -> Result<()> {
    let coordinator = Coordinator::from_config(load_agent_config());
    let probes = coordinator.probe_status().await;

    match cli.format {
        OutputFormat::Text => {
            println!("Detection probes (highest priority first):");
            println!();
            for probe in &probes {
                let categories: Vec<String> = probe.categories.iter().map(|c| c.to_string()).collect();
                println!(
                    "  {:<10} {:>3}  {:<13} {}",
                    probe.name,
                    probe.priority,
                    if probe.available { "available" } else { "unavailable" },
                    categories.join(", ")
                );
            }
            if probes.is_empty() {
                println!("  (none enabled)");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "probes": probes }));
        }
    }

    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let coordinator = Coordinator::from_config(load_agent_config());
    let cancel = CancellationToken::new();
    let (stats, _) = tokio::join!(coordinator.system_stats(), coordinator.scan_now(&cancel));
    let stats = stats?;
    let devices = coordinator.snapshot().statistics();
    let elevated = privileges::is_elevated();

    match cli.format {
        OutputFormat::Text => {
            println!(
                "Platform: {} {}",
                stats.platform,
                stats.os_version.as_deref().unwrap_or("")
            );
            println!("CPU:      {:.1}%", stats.cpu_percent);
            println!(
                "Memory:   {:.1}% ({} / {} MiB)",
                stats.memory_percent,
                stats.memory_used_bytes / (1024 * 1024),
                stats.memory_total_bytes / (1024 * 1024)
            );
            match stats.battery {
                Some(battery) => {
                    let power = match battery.plugged {
                        Some(true) => ", plugged in",
                        Some(false) => ", on battery",
                        None => "",
                    };
                    println!("Battery:  {}%{}", battery.percent, power);
                }
                None => println!("Battery:  -"),
            }
            println!();
            println!("Devices:  {} ({} manageable)", devices.total, devices.manageable);
            for (category, count) in &devices.by_category {
                println!("  {:<16} {}", category.to_string(), count);
            }
            for (status, count) in &devices.by_status {
                println!("  {:<16} {}", status.to_string(), count);
            }
            println!();
            if elevated {
                println!("Privileges: elevated (management available)");
            } else {
                println!("Privileges: standard user");
                println!();
                println!("{}", privileges::elevation_instructions());
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "system": stats,
                    "devices": devices,
                    "elevated": elevated,
                })
            );
        }
    }

    Ok(())
}

async fn cmd_config(cli: &Cli) -> Result<()> {
    let config = load_agent_config();
    let config_path = config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Loaded from:      {}", config.source);
            println!("Scan interval:    {}s", config.scan_interval_secs);
            println!("Probe timeout:    {}s", config.probe_timeout_secs);
            println!("Command timeout:  {}s", config.command_timeout_secs);
            println!("Miss threshold:   {}", config.miss_threshold);
            println!("Warm-start cache: {}", config.warm_start_cache);
            if !config.disabled_probes.is_empty() {
                println!("Disabled probes:  {}", config.disabled_probes.join(", "));
            }
            println!();
            println!("Environment variables:");
            println!("  AIRSCOUT_SCAN_INTERVAL  - Seconds between scan cycles");
            println!("  AIRSCOUT_PROBE_TIMEOUT  - Per-probe timeout in seconds");
            println!("  AIRSCOUT_MISS_THRESHOLD - Missed cycles before removal");
            println!("  AIRSCOUT_CACHE          - Enable the warm-start cache (true/false)");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "config": config,
                })
            );
        }
    }

    Ok(())
}
