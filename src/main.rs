//! fps-probe daemon.
//!
//! Runs the frame-rate monitor against the device shell and logs every
//! delivered value until SIGINT or SIGTERM.

use fps_probe::config::ConfigManager;
use fps_probe::engine::FpsEngine;
use fps_probe::error::DaemonError;
use fps_probe::executor::ShellExecutor;
use fps_probe::logging;
use fps_probe::vsync::SoftwareVsync;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("fps-probe daemon starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("fps-probe daemon shut down gracefully"),
        Err(e) => error!("fps-probe daemon error: {}", e),
    }

    result.map_err(Into::into)
}

async fn run_daemon() -> Result<(), DaemonError> {
    let config_path = ConfigManager::default_path();
    let config_manager = ConfigManager::load_or_default(&config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let config = config_manager.get();

    let executor = Arc::new(ShellExecutor::with_timeout(
        config.shell.clone(),
        Duration::from_millis(config.command_timeout_ms),
    ));
    let vsync = Arc::new(SoftwareVsync::new(config.software_vsync_hz)?);
    let engine = FpsEngine::new(config, executor, vsync);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(shutdown_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    engine.start_monitoring(|fps| info!(fps, "Frame rate"))?;

    match engine.counter_path() {
        Some(path) => info!("Using counter file {}", path),
        None => warn!("No frame counter file found on this device"),
    }

    info!("fps-probe daemon initialized and running");

    let signalled = shutdown_rx.changed().await;

    info!("Shutdown signal received, stopping monitor...");
    engine.destroy();

    let metrics = engine.metrics();
    info!(
        total_queries = metrics.total_queries,
        cache_fallbacks = metrics.cache_fallbacks,
        samples = engine.history_len(),
        smoothed_fps = engine.smoothed_fps(),
        low_fps = engine.low_fps(),
        "Session summary"
    );

    signalled.map_err(|_| DaemonError::Runtime("signal handler exited unexpectedly".into()))
}

/// Wait for SIGTERM or SIGINT, then broadcast shutdown.
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}
