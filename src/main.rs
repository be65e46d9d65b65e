//! Flash PLL daemon.
//!
//! Drives the PLL against a simulated capture device and pulse output on the
//! system monotonic clock. Frames are produced on a tokio timer at the
//! camera's current frame rate and fed to the PLL one by one.

use flash_pll::config::{ConfigManager, DaemonConfig};
use flash_pll::logging;
use flash_pll::sim::{SimulatedCamera, SimulatedPulseOutput};
use flash_pll::{CaptureParameterSink, FlashPll, LocalClock, MonotonicClock};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Graceful shutdown timeout in seconds
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

type SimulatedPll = FlashPll<SimulatedPulseOutput<MonotonicClock>, MonotonicClock>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("Flash PLL daemon starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("Flash PLL daemon shut down gracefully"),
        Err(e) => error!("Flash PLL daemon error: {}", e),
    }

    result
}

async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ConfigManager::default_path);
    let config_manager = ConfigManager::load_or_default(&config_path)?;
    info!("Configuration loaded from {:?}", config_path);

    let config = config_manager.get();
    if !config.pll.enabled {
        info!("PLL disabled in configuration, nothing to do");
        return Ok(());
    }

    let clock = MonotonicClock::new();
    info!(resolution_ns = clock.resolution_nanos(), "Using monotonic clock");

    let camera = SimulatedCamera::new(clock, config.frame_rate_hz, config.simulation.offset_us)
        .with_drift_ppm(config.simulation.drift_ppm);
    let output = SimulatedPulseOutput::new(clock, config.simulation.activation_latency_us);

    // The pulse output is simulated, so no register access is needed.
    let mut pll = FlashPll::with_clock(config.pll.clone(), output, clock, true);
    pll.start(camera.frame_rate())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(shutdown_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    let mut shutdown_rx_main = shutdown_rx.clone();
    let frame_handle = tokio::spawn(run_frame_loop(pll, camera, config, shutdown_rx));

    info!("Flash PLL daemon initialized and running");

    shutdown_rx_main.changed().await.ok();
    info!("Shutdown signal received, stopping frame loop...");

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    if tokio::time::timeout(shutdown_timeout, frame_handle).await.is_err() {
        warn!("Frame loop did not stop within {}s", SHUTDOWN_TIMEOUT_SECS);
    }

    Ok(())
}

/// Frame-tick task. Owns the PLL and the simulated camera until shutdown.
async fn run_frame_loop(
    mut pll: SimulatedPll,
    mut camera: SimulatedCamera<MonotonicClock>,
    config: DaemonConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut next_frame = Instant::now();
    let mut frames: u64 = 0;

    loop {
        next_frame += Duration::from_secs_f64(camera.frame_interval_us() / 1_000_000.0);

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Frame loop shutting down");
                    break;
                }
            }
            _ = tokio::time::sleep_until(next_frame) => {
                let frame = camera.capture_frame();
                frames += 1;

                match pll.update(&mut camera, frame) {
                    Ok(update) => {
                        debug!(frame = frames, diff_us = update.phase.diff_us, "Frame processed");
                    }
                    Err(e) => {
                        warn!(frame = frames, "Frame update failed: {}", e);
                    }
                }

                if frames % config.status_interval_frames == 0 {
                    let status = pll.lock_status();
                    info!(
                        locked = status.locked,
                        error_us = status.stabilized_error_us,
                        stability_us = status.stability_us,
                        fps = status.frame_rate_hz,
                        offset_us = status.offset_us,
                        rate_writes = status.rate_writes,
                        "Lock status"
                    );
                }
            }
        }
    }

    if let Err(e) = pll.stop(&mut camera) {
        warn!("Failed to stop PLL cleanly: {}", e);
    }
}

/// Set up signal handlers for graceful shutdown.
/// Handles SIGTERM and SIGINT.
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
