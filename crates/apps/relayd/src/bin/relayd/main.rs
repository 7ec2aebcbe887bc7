mod bootstrap;
mod config;

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// The dual-path mesh transport core daemon: bridges the local multicast
/// application bus with a high-bandwidth mesh (observed via an external
/// link-state feed) and a low-bandwidth, proof-acknowledged overlay.
#[derive(Parser, Debug)]
#[command(name = "relayd")]
struct Args {
    /// Flat key=value config file. Falls back to built-in defaults if
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides LOG_LEVEL from the config file.
    #[arg(long)]
    log_level: Option<String>,
    /// Overrides BRIDGE_IFACE from the config file.
    #[arg(long)]
    bridge_iface: Option<String>,
    /// Runs overlay-only, without opening real multicast sockets — for
    /// exercising the sender/path/peer-directory pipeline offline.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match bootstrap::load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("relayd: fatal config error: {err:#}");
            std::process::exit(1);
        }
    };

    bootstrap::init_tracing(&config.log_level);

    if config.startup_delay_secs > 0 {
        tracing::info!(seconds = config.startup_delay_secs, "waiting for overlay radio to settle before joining the bus");
        tokio::time::sleep(std::time::Duration::from_secs(config.startup_delay_secs)).await;
    }

    let shutdown = CancellationToken::new();
    let shutdown_for_signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping tasks");
        shutdown_for_signals.cancel();
    });

    match bootstrap::run(config, args.dry_run, shutdown).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, "relayd exiting on fatal error");
            std::process::exit(1);
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
