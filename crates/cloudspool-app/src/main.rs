// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// CloudSpool connector
//
// Entry point. Parses flags, initialises logging, loads the configuration,
// wires the printer manager to its collaborators, serves the monitor socket,
// and turns stop signals into a graceful drain.

mod fixture;
mod monitor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudspool_core::config::ConnectorConfig;
use cloudspool_core::error::Result;
use cloudspool_manager::{PrinterManager, RefreshReason, ShutdownController, ShutdownPhase};

use fixture::Fixture;
use monitor::Monitor;

/// Bridges a local print spooler and a cloud print service.
#[derive(Parser, Debug)]
#[command(name = "cloudspool-connector", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed the in-memory spooler and cloud from this JSON file
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_default_config {
        return match serde_json::to_string_pretty(&ConnectorConfig::default()) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cloudspool-connector: {e}");
                ExitCode::FAILURE
            }
        };
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "connector failed to start");
            eprintln!("cloudspool-connector: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = match &cli.config {
        Some(path) => ConnectorConfig::from_file(path)?,
        None => {
            let config = ConnectorConfig::default();
            config.validate()?;
            config
        }
    };

    let monitor = Monitor::bind(&config.monitor_socket_path)?;

    let fixture = match &cli.fixture {
        Some(path) => Fixture::load(path)?,
        None => {
            warn!("no fixture given, starting with empty in-memory backends");
            Fixture::default()
        }
    };

    let controller = Arc::new(ShutdownController::new());
    let manager = PrinterManager::new(&config, fixture.into_collaborators(), controller.token())?;
    manager.start()?;
    let monitor_path = monitor.path().to_path_buf();
    let monitor_task = tokio::spawn(monitor.serve(Arc::clone(&manager), controller.token()));

    println!("Ready to print as proxy '{}'", manager.proxy_name());
    info!(
        proxy = %manager.proxy_name(),
        monitor = %monitor_path.display(),
        "connector ready"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, refreshing");
                if let Err(e) = manager.request_refresh(RefreshReason::Manual) {
                    warn!(error = %e, "refresh request refused");
                }
            }
        }
    }

    controller.signal();
    println!("Shutting down");
    spawn_force_exit_watch(Arc::clone(&controller), sigterm);

    let report = manager.quit().await?;
    if let Err(e) = monitor_task.await {
        warn!(error = %e, "monitor task ended abnormally");
    }

    let code = controller.phase().exit_code(report.drained);
    info!(drained = report.drained, exit_code = code, "connector stopped");
    Ok(code as u8)
}

/// A second stop signal while draining exits at once with status 1.
fn spawn_force_exit_watch(
    controller: Arc<ShutdownController>,
    mut sigterm: tokio::signal::unix::Signal,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        if controller.signal() == ShutdownPhase::Forced {
            eprintln!("Forced shutdown");
            std::process::exit(1);
        }
    });
}
