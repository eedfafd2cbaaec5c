//! Presence Report - daily dwell totals and history gaps
//!
//! Replays a history file offline and prints per-device daily totals.
//!
//! Usage:
//!   presence-report --config config/dev.toml
//!   presence-report --history presence.jsonl --date 2026-01-05
//!   presence-report --history presence.jsonl --fingerprint 3f2a9c01b7e4 --events
//!   presence-report --history presence.jsonl --devices

use anyhow::Context;
use ble_presence::domain::types::FingerprintId;
use ble_presence::infra::Config;
use ble_presence::io::history::read_history;
use ble_presence::services::recovery::replay;
use chrono::NaiveDate;
use clap::Parser;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Presence Report - summarize a presence history file
#[derive(Parser, Debug)]
#[command(name = "presence-report", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (history path and fingerprint version);
    /// defaults to $CONFIG_FILE, then config/dev.toml
    #[arg(short, long)]
    config: Option<String>,

    /// History file; overrides history.file
    #[arg(long)]
    history: Option<String>,

    /// Only report this UTC date (YYYY-MM-DD)
    #[arg(short, long)]
    date: Option<NaiveDate>,

    /// Only report this fingerprint
    #[arg(short, long)]
    fingerprint: Option<String>,

    /// Also list the individual ENTER/LEAVE events
    #[arg(short, long)]
    events: bool,

    /// Also list the device registry (labels, counters, names, addresses)
    #[arg(long)]
    devices: bool,
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());
    let path = args.history.clone().unwrap_or_else(|| config.history_file().to_string());

    let records = read_history(&path).with_context(|| format!("Failed to load {}", path))?;
    // Keep everything in memory for the report
    let recovered = replay(&records, config.fingerprint_version(), u32::MAX);
    let fingerprint = args.fingerprint.as_deref().map(FingerprintId::from);

    println!("history: {} ({} sessions, {} events)", path, recovered.sessions, recovered.events);
    println!();
    println!("{:<34} {:<10} {:>6} {:>10} {:>6}", "fingerprint", "date", "enters", "dwell", "final");

    let mut rows = 0;
    for daily in recovered.aggregator.all() {
        if args.date.is_some_and(|date| date != daily.date) {
            continue;
        }
        if fingerprint.as_ref().is_some_and(|fp| *fp != daily.fingerprint) {
            continue;
        }
        println!(
            "{:<34} {:<10} {:>6} {:>10} {:>6}",
            daily.fingerprint,
            daily.date,
            daily.enter_count,
            format_duration(daily.dwell_ms),
            if daily.sealed { "yes" } else { "no" }
        );
        rows += 1;
    }
    if rows == 0 {
        println!("(no matching aggregates)");
    }

    if args.events {
        println!();
        println!("{:<34} {:<6} {:<25} {:>5}", "fingerprint", "kind", "timestamp", "rssi");
        for record in &records {
            let ble_presence::io::HistoryRecord::Event(event) = record else {
                continue;
            };
            if args.date.is_some_and(|date| date != event.timestamp.date_naive()) {
                continue;
            }
            if fingerprint.as_ref().is_some_and(|fp| *fp != event.fingerprint) {
                continue;
            }
            let rssi = event.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "{:<34} {:<6} {:<25} {:>5}",
                event.fingerprint,
                event.kind.as_str(),
                event.timestamp.to_rfc3339(),
                rssi
            );
        }
    }

    if args.devices {
        println!();
        println!(
            "{:<34} {:<8} {:<16} {:<8} {:>7} {:>6} {:>5}  names / addresses",
            "fingerprint", "state", "vendor", "beacon", "seen", "enters", "best"
        );
        for device in &recovered.devices {
            if fingerprint.as_ref().is_some_and(|fp| *fp != device.fingerprint) {
                continue;
            }
            let best = device.best_rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "{:<34} {:<8} {:<16} {:<8} {:>7} {:>6} {:>5}  {} / {}",
                device.fingerprint,
                device.state.as_str(),
                device.vendor,
                device.beacon,
                device.seen_count,
                device.enter_count,
                best,
                device.names.join(", "),
                device.addresses.join(", ")
            );
        }
    }

    if !recovered.gaps.is_empty() {
        println!();
        println!("gaps:");
        for gap in &recovered.gaps {
            let who = gap.fingerprint.as_ref().map(|fp| fp.to_string()).unwrap_or_default();
            println!("  {} {} {:?}", gap.at.to_rfc3339(), who, gap.kind);
        }
    }

    Ok(())
}
