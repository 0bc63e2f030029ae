//! Foreground watch mode
//!
//! Runs the background scan loop and prints registry changes:
//! - Paints the warm-start cache first, if any
//! - Prints added, updated and removed devices as cycles complete
//! - Stops cleanly on SIGTERM/SIGINT

use crate::{format_device, OutputFormat};
use airscout_core::{load_agent_config, Coordinator, RegistryEvent};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Watch the registry until interrupted
pub async fn run_watch(format: OutputFormat, interval_secs: Option<u64>) -> Result<()> {
    let mut config = load_agent_config();
    if let Some(secs) = interval_secs {
        config.scan_interval_secs = secs.max(1);
    }

    tracing::info!(
        "Watching wireless devices every {}s (config from {})",
        config.scan_interval_secs,
        config.source
    );

    let coordinator = Arc::new(Coordinator::from_config(config));
    let mut events = coordinator.subscribe();

    let seeded = coordinator.warm_start().await;
    if seeded > 0 {
        if let OutputFormat::Text = format {
            println!("Cached devices (awaiting first scan):");
            for device in coordinator.snapshot().devices.iter() {
                println!("{}", format_device(device));
            }
            println!();
        }
    }

    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone());

    let scanner = tokio::spawn({
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        async move { coordinator.run(cancel).await }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(format, &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} registry events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Err(e) = scanner.await {
        tracing::error!("Scan loop ended abnormally: {}", e);
    }

    tracing::info!("Watch stopped");
    Ok(())
}

fn print_event(format: OutputFormat, event: &RegistryEvent) {
    match format {
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        },
        OutputFormat::Text => match event {
            RegistryEvent::Added { device } => println!("+ {}", format_device(device).trim_start()),
            RegistryEvent::Updated { device } => println!("~ {}", format_device(device).trim_start()),
            RegistryEvent::Removed { id } => println!("- {}", id),
            RegistryEvent::CycleCompleted { generation, .. } => {
                tracing::debug!("Cycle {} complete", generation);
            }
        },
    }
}

/// Cancel `shutdown` on SIGTERM or SIGINT (Ctrl+C elsewhere)
fn setup_signal_handlers(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ] {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        tracing::info!("Received {}", name);
                        shutdown.cancel();
                    });
                }
                Err(e) => tracing::warn!("Failed to register {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C");
                shutdown.cancel();
            }
        });
    }
}
