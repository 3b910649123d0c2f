//! Rewind Capture – keeps a rolling window of recent audio on disk.
//!
//! This binary:
//! 1. Reads configuration from `rewind.conf`
//! 2. Reserves the capture device and opens the segment index
//! 3. Runs the capture engine (rotation, call handover, retention, health)
//! 4. Serves status and control over HTTP
//!
//! SIGHUP re-reads the config file and applies the new settings live.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rewind_capture::arbiter::NoCallLog;
use rewind_capture::reservation::DeviceReservation;
use rewind_capture::server::{self, AppState};
use rewind_capture::service::{Collaborators, Service, ServiceOptions};
use rewind_capture::sink::{ArecordProbe, ArecordSink};
use rewind_common::config;
use rewind_common::files::LocalFileStore;
use rewind_common::index::SqliteSegmentStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| config::Config::default_path().to_string()),
    );
    let config = config::load(&config_path).context("Config load failed")?;
    config.validate()?;

    info!(
        "Rewind Capture starting (segments={}s, adaptive={}, retention={}min, listen={})",
        config.settings.segment_duration_seconds,
        config.settings.adaptive_mode_enabled,
        config.settings.retention_period_ms / 60_000,
        config.listen_addr
    );

    std::fs::create_dir_all(&config.recs_dir).context("Cannot create recordings directory")?;
    let reservation = DeviceReservation::acquire(&config.recs_dir.join("rewind.lock"))?;

    let store = SqliteSegmentStore::open(&config.db_path).context("Cannot open segment index")?;
    let files = LocalFileStore::new(config.segments_dir()).context("Cannot create segments directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        on_signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start engine ─────────────────────────────────────────────────
    let (call_tx, call_rx) = mpsc::channel(16);
    let service = Service::start(
        ServiceOptions::from(&config),
        config.settings.clone(),
        Collaborators {
            sink: Box::new(ArecordSink::new(config.rec_card.clone())),
            probe: Arc::new(ArecordProbe::new(
                config.rec_card.clone(),
                config.settings.sample_rate_hz,
            )),
            files: Arc::new(files),
            store: Arc::new(store),
            call_events: Some(call_rx),
            call_log: Arc::new(NoCallLog),
            reservation: Some(reservation),
        },
    )
    .await;

    // ── start HTTP server ────────────────────────────────────────────
    let state = AppState {
        controller: service.controller.clone(),
        retention: service.retention.clone(),
        health: service.health.clone(),
        call_events: Some(call_tx),
        saved_dir: service.saved_dir.clone(),
    };
    let listen_addr = config.listen_addr.clone();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run(state, &listen_addr, server_shutdown).await {
            error!("HTTP server error: {e:#}");
        }
    });

    // ── reload on SIGHUP ─────────────────────────────────────────────
    let mut hangup = signal(SignalKind::hangup()).context("Cannot listen for SIGHUP")?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = hangup.recv() => {
                match config::load(&config_path).and_then(|c| c.validate().map(|_| c)) {
                    Ok(reloaded) => service.update_settings(reloaded.settings),
                    Err(e) => warn!("Keeping current settings, reload failed: {e:#}"),
                }
            }
        }
    }

    service.shutdown().await;
    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {e}");
    }
    info!("Rewind Capture stopped");

    Ok(())
}
