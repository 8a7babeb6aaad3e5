//! Order book depth recorder
//!
//! Captures the diff stream and reconciling snapshots for every configured
//! symbol and writes them to rotating files under `data_directory`.
//!
//! Usage:
//!   cargo run --bin depth_recorder
//!   RECORDER_CONFIG=btc.json cargo run --bin depth_recorder

use anyhow::Context;
use depth_recorder::{init_logging, run_recorder, RecorderConfig};
use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_logging();

    let config_path = PathBuf::from(env::var("RECORDER_CONFIG").unwrap_or_else(|_| "config.json".to_string()));
    let config = RecorderConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    info!("═══════════════════════════════════════════════════════");
    info!("Depth Recorder");
    info!("═══════════════════════════════════════════════════════");
    info!("Symbols: {}", config.symbols.join(", "));
    info!("Output: {:?} -> {}", config.output_format, config.data_directory.display());
    info!("Depth: {:?}", config.capture_depth);
    info!("═══════════════════════════════════════════════════════");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match shutdown_signal().await {
                Ok(signal) => {
                    info!("Received {}, shutting down", signal);
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signals: {}", e),
            }
        }
    });

    run_recorder(config, cancel).await?;
    info!("Depth recorder stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
