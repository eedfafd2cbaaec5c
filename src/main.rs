//! BLE presence tracker
//!
//! Reads BLE scan observations (JSON lines), resolves them into stable
//! device identities and tracks arrival, departure and daily dwell time.
//!
//! Module structure:
//! - `domain/` - Core types (Observation, Fingerprint, PresenceEvent, DeviceRecord)
//! - `io/` - External interfaces (scan input, history file, webhook)
//! - `services/` - Business logic (fingerprinting, presence, aggregation, notifications)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use ble_presence::infra::{Config, Metrics};
use ble_presence::io::history::read_history;
use ble_presence::io::{open_source, EventHistoryStore, WebhookClient};
use ble_presence::services::recovery::replay;
use ble_presence::services::{create_notifier, Pipeline};
use chrono::Utc;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// BLE presence tracker - identity resolution and dwell tracking
#[derive(Parser, Debug)]
#[command(name = "ble-presence", version, about)]
struct Args {
    /// Path to TOML configuration file; defaults to $CONFIG_FILE, then
    /// config/dev.toml
    #[arg(short, long)]
    config: Option<String>,

    /// Scan input ("-" for stdin); overrides scan.input
    #[arg(short, long)]
    input: Option<String>,

    /// History file; overrides history.file
    #[arg(long)]
    history: Option<String>,

    /// Disable entry notifications
    #[arg(long)]
    no_notify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-observation visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr; stdin may carry the scan stream
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "ble-presence starting");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref());
    if let Some(history) = &args.history {
        config = config.with_history_file(history);
    }
    let scan_input = args.input.clone().unwrap_or_else(|| config.scan_input().to_string());
    let notify_enabled = config.notify_enabled() && !args.no_notify;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        absence_timeout_secs = %config.absence_timeout_secs(),
        fingerprint_version = %config.fingerprint_version().as_str(),
        history_file = %config.history_file(),
        scan_input = %scan_input,
        notify_enabled = %notify_enabled,
        notify_url = %config.notify_url(),
        "config_loaded"
    );

    // Rebuild state from the existing history before appending to it
    let recovered = if Path::new(config.history_file()).exists() {
        let records = read_history(config.history_file())?;
        Some(replay(&records, config.fingerprint_version(), config.retention_days()))
    } else {
        None
    };

    let history = Arc::new(
        EventHistoryStore::open(config.history_file()).context("Failed to open event history")?,
    );
    let metrics = Arc::new(Metrics::new());

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Notification worker (off the hot path)
    let (notifier, notifier_task) = if notify_enabled {
        let client = WebhookClient::new(config.notify_url(), config.notify_timeout())?;
        let (handle, worker) = create_notifier(
            client,
            config.notify_queue_size(),
            config.notify_max_in_flight(),
            config.notify_timeout(),
            metrics.clone(),
        );
        (Some(handle), Some(tokio::spawn(worker.run())))
    } else {
        (None, None)
    };

    let pipeline = Arc::new(Pipeline::new(config.clone(), history, notifier, metrics.clone()));
    if let Some(recovered) = recovered {
        for gap in &recovered.gaps {
            warn!(fingerprint = ?gap.fingerprint, at = %gap.at, kind = ?gap.kind, "history_gap");
        }
        pipeline.restore(recovered);
    }

    let session_id = uuid::Uuid::now_v7().to_string();
    if let Err(e) = pipeline.start_session(&session_id, Utc::now()) {
        error!(error = %e, "session_record_failed");
    }
    info!(session_id = %session_id, "session_started");

    // Create observation channel (bounded for backpressure)
    let (obs_tx, obs_rx) = mpsc::channel(config.scan_channel_size());

    // Start scan source
    let mut source = open_source(&scan_input, metrics.clone()).await?;
    let source_shutdown = shutdown_rx.clone();
    let source_task = tokio::spawn(async move {
        if let Err(e) = source.run(obs_tx, source_shutdown).await {
            error!(source = %source.name(), error = %format!("{:#}", e), "scan_source_error");
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run pipeline - consumes observations until shutdown or end of input
    pipeline.run(obs_rx, shutdown_rx).await;

    if let Err(e) = source_task.await {
        error!(error = %e, "scan_source_task_failed");
    }

    // Dropping the pipeline drops the last notifier handle; the worker then
    // finishes in-flight calls (each bounded by the timeout)
    drop(pipeline);
    if let Some(task) = notifier_task {
        if let Err(e) = task.await {
            error!(error = %e, "notification_worker_failed");
        }
    }

    info!("ble-presence shutdown complete");
    Ok(())
}
