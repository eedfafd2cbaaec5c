//! Presence pipeline - central observation processor
//!
//! raw observation -> normalizer -> fingerprint + classifier -> presence
//! tracker -> {daily aggregator, event history, notifier}
//!
//! Fan-out happens inside the tracker callback, while the device lock is
//! held. Lock order is always device -> aggregator -> history writer, and
//! each fingerprint's events reach every consumer in the order they were
//! produced. The pipeline is `Sync`; several sources may call `ingest`
//! concurrently.
//!
//! The live loop sweeps on the observations' own clock (see `SweepClock`),
//! so a scan host whose clock differs from ours cannot fake absences.

use crate::domain::device::{DailyAggregate, DeviceRecord};
use crate::domain::types::{
    FingerprintId, Observation, PresenceEvent, RawObservation, TransitionKind,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::history::{EventHistoryStore, HistoryRecord, PersistError};
use crate::services::aggregator::DailyAggregator;
use crate::services::classifier::classify;
use crate::services::fingerprint::FingerprintEngine;
use crate::services::normalizer::normalize;
use crate::services::notifier::{EnterNotification, NotifierHandle};
use crate::services::presence::PresenceTracker;
use crate::services::recovery::Recovered;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Clock the live sweep runs on: the newest observation time, advanced by
/// the wall time elapsed since it arrived. Falls back to the local clock
/// until the first observation. Never moves backwards.
#[derive(Debug, Default)]
struct SweepClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
}

impl SweepClock {
    fn observe(&mut self, observed_at: DateTime<Utc>) {
        if self.anchor.is_none() || observed_at > self.now() {
            self.anchor = Some((observed_at, Instant::now()));
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match self.anchor {
            Some((at, since)) => {
                at + TimeDelta::from_std(since.elapsed()).unwrap_or(TimeDelta::zero())
            }
            None => Utc::now(),
        }
    }
}

/// Result of one absence sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub left: usize,
    /// Records the history store could not persist
    pub failed: Vec<PersistError>,
}

pub struct Pipeline {
    config: Config,
    engine: FingerprintEngine,
    tracker: PresenceTracker,
    aggregator: Mutex<DailyAggregator>,
    history: Arc<EventHistoryStore>,
    notifier: Option<NotifierHandle>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        history: Arc<EventHistoryStore>,
        notifier: Option<NotifierHandle>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let engine = FingerprintEngine::new(config.fingerprint_version());
        let tracker = PresenceTracker::new(config.absence_timeout());
        let aggregator = Mutex::new(DailyAggregator::new(config.retention_days()));

        info!(
            fingerprint_version = %engine.version().as_str(),
            anonymous_fingerprint = %engine.anonymous(),
            absence_timeout_secs = %config.absence_timeout_secs(),
            suppress_anonymous = %config.suppress_anonymous(),
            notify = %notifier.is_some(),
            "pipeline_initialized"
        );

        Self { config, engine, tracker, aggregator, history, notifier, metrics }
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    pub fn history(&self) -> &EventHistoryStore {
        &self.history
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Install state rebuilt from history
    pub fn restore(&self, recovered: Recovered) {
        let devices = recovered.devices.len();
        for record in recovered.devices {
            self.tracker.restore(record);
        }
        *self.aggregator.lock() = recovered.aggregator;
        info!(devices = %devices, present = %self.tracker.present_count(), "pipeline_restored");
    }

    /// Write the session marker for this process
    pub fn start_session(
        &self,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), PersistError> {
        self.history.append(&HistoryRecord::Session {
            session_id: session_id.to_string(),
            started_at,
            site: self.config.site_id().to_string(),
            fingerprint_version: self.engine.version().as_str().to_string(),
        })
    }

    /// Normalize and process one raw scan record
    pub fn ingest(
        &self,
        raw: RawObservation,
        received_at: DateTime<Utc>,
    ) -> Result<Option<PresenceEvent>, PersistError> {
        match normalize(raw, received_at) {
            Some(observation) => self.process(&observation),
            None => {
                self.metrics.record_observation_dropped();
                debug!("observation_dropped");
                Ok(None)
            }
        }
    }

    /// Process one normalized observation. Returns the ENTER event if the
    /// device just arrived. A persistence failure is returned, but the
    /// presence state has advanced regardless.
    pub fn process(&self, observation: &Observation) -> Result<Option<PresenceEvent>, PersistError> {
        let start = Instant::now();
        let fingerprint = self.engine.fingerprint(observation);

        if fingerprint.is_anonymous() && self.config.suppress_anonymous() {
            self.metrics.record_anonymous_suppressed();
            debug!(address = %observation.address, "anonymous_observation_suppressed");
            return Ok(None);
        }

        let labels = classify(observation);
        let (step, outcome) =
            self.tracker.observe(&fingerprint, labels, observation, |event, record| {
                self.fan_out(event, record, Some(observation))
            });

        if step.clock_anomaly {
            self.metrics.record_clock_anomaly();
        }
        self.metrics.record_observation_processed(start.elapsed().as_micros() as u64);

        match outcome {
            Some(Err(e)) => Err(e),
            _ => Ok(step.event),
        }
    }

    /// Run the absence check at `now`
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut failed = Vec::new();
        let left = self.tracker.sweep(now, |event, record| {
            if let Err(e) = self.fan_out(event, record, None) {
                failed.push(e);
            }
        });
        SweepReport { left, failed }
    }

    /// Deliver one transition to the aggregator, history and notifier.
    /// Called with the device lock held.
    fn fan_out(
        &self,
        event: &PresenceEvent,
        record: &DeviceRecord,
        observation: Option<&Observation>,
    ) -> Result<(), PersistError> {
        match event.kind {
            TransitionKind::Enter => self.metrics.record_enter(),
            TransitionKind::Leave => self.metrics.record_leave(),
        }

        let update = self.aggregator.lock().apply(event);

        let mut result = self.history.append(&HistoryRecord::Event(event.clone()));
        for sealed in update.sealed {
            debug!(
                fingerprint = %sealed.fingerprint,
                date = %sealed.date,
                dwell_ms = %sealed.dwell_ms,
                "daily_aggregate_sealed"
            );
            let appended = self.history.append(&HistoryRecord::Daily(sealed));
            if result.is_ok() {
                result = appended;
            }
        }
        if event.kind == TransitionKind::Leave {
            let appended = self.history.append(&HistoryRecord::Device(record.snapshot()));
            if result.is_ok() {
                result = appended;
            }
        }
        if result.is_err() {
            self.metrics.record_history_append_failure();
        }

        if event.kind == TransitionKind::Enter {
            if let (Some(notifier), Some(observation)) = (&self.notifier, observation) {
                if self.qualifies(record, observation) {
                    let payload =
                        EnterNotification::new(self.config.site_id(), event, record, observation);
                    notifier.notify(payload);
                } else {
                    self.metrics.record_notification_skipped();
                    debug!(fingerprint = %event.fingerprint, "notification_skipped");
                }
            }
        }

        result
    }

    /// Whether an arriving device is worth a notification
    fn qualifies(&self, record: &DeviceRecord, observation: &Observation) -> bool {
        let name = observation.local_name.as_deref().or(record.names.first().map(String::as_str));
        if self.config.is_name_suppressed(name) {
            return false;
        }
        if self.config.notify_require_identity() {
            return name.is_some() || record.vendor != "unknown";
        }
        true
    }

    /// Persist device snapshots and non-final aggregate snapshots, then
    /// sync the history file. Returns the number of aggregates written.
    pub fn flush(&self) -> Result<usize, PersistError> {
        let mut first_error = None;
        let mut devices = 0;
        for record in self.tracker.snapshot() {
            match self.history.append(&HistoryRecord::Device(record.snapshot())) {
                Ok(()) => devices += 1,
                Err(e) => {
                    self.metrics.record_history_append_failure();
                    first_error.get_or_insert(e);
                }
            }
        }

        let pending = self.aggregator.lock().pending();
        let mut written = 0;
        for aggregate in pending {
            match self.history.append(&HistoryRecord::Daily(aggregate)) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.metrics.record_history_append_failure();
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.history.sync() {
            warn!(error = %format!("{:#}", e), "history_sync_failed");
        }
        info!(devices = %devices, snapshots = %written, "history_flushed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Current daily aggregate for a device
    pub fn daily(&self, fingerprint: &FingerprintId, date: NaiveDate) -> Option<DailyAggregate> {
        self.aggregator.lock().get(fingerprint, date).cloned()
    }

    /// Total dwell credited to a device across retained dates
    pub fn total_dwell_ms(&self, fingerprint: &FingerprintId) -> u64 {
        self.aggregator.lock().total_dwell_ms(fingerprint)
    }

    pub fn report_metrics(&self) {
        self.metrics.report(self.tracker.len(), self.tracker.present_count()).log();
    }

    /// Main loop: process observations, sweep on a fixed interval, report
    /// metrics. Queued observations always go before a sweep. Returns after
    /// shutdown (or when every source is gone), once the queue is drained
    /// and aggregates are flushed.
    pub async fn run(
        &self,
        mut obs_rx: mpsc::Receiver<Observation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep_interval = interval(self.config.sweep_interval());
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut metrics_interval =
            interval(Duration::from_secs(self.config.metrics_interval_secs()));
        metrics_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut clock = SweepClock::default();

        info!(sweep_interval_ms = %self.config.sweep_interval().as_millis(), "pipeline_started");

        loop {
            tokio::select! {
                biased;

                observation = obs_rx.recv() => match observation {
                    Some(observation) => self.handle(&observation, &mut clock),
                    None => {
                        info!("observation_channel_closed");
                        break;
                    }
                },
                _ = sweep_interval.tick() => {
                    self.drain(&mut obs_rx, &mut clock);
                    self.handle_sweep(clock.now());
                }
                _ = metrics_interval.tick() => self.report_metrics(),
                _ = shutdown.changed() => {
                    info!("pipeline_shutdown_requested");
                    break;
                }
            }
        }

        let drained = self.drain(&mut obs_rx, &mut clock);
        if drained > 0 {
            info!(observations = %drained, "pipeline_drained");
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "aggregate_flush_incomplete");
        }
        self.report_metrics();
        info!("pipeline_stopped");
    }

    fn handle(&self, observation: &Observation, clock: &mut SweepClock) {
        clock.observe(observation.observed_at);
        if let Err(e) = self.process(observation) {
            debug!(error = %e, "observation_not_persisted");
        }
    }

    fn handle_sweep(&self, now: DateTime<Utc>) {
        let report = self.sweep(now);
        if !report.failed.is_empty() {
            debug!(left = %report.left, failed = %report.failed.len(), "sweep_not_persisted");
        }
    }

    /// Process everything already queued
    fn drain(&self, obs_rx: &mut mpsc::Receiver<Observation>, clock: &mut SweepClock) -> usize {
        let mut count = 0;
        while let Ok(observation) = obs_rx.try_recv() {
            self.handle(&observation, clock);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(s)
    }

    fn pipeline(dir: &tempfile::TempDir) -> Pipeline {
        let path = dir.path().join("history.jsonl");
        let config = Config::default()
            .with_absence_timeout_secs(30)
            .with_history_file(path.to_str().unwrap());
        let history = Arc::new(EventHistoryStore::open(config.history_file()).unwrap());
        Pipeline::new(config, history, None, Arc::new(Metrics::new()))
    }

    fn phone(at: DateTime<Utc>) -> Observation {
        Observation::new("AA:BB:CC:DD:EE:01", at)
            .with_manufacturer(0x004C, &[0x10, 0x05])
            .with_rssi(-60)
    }

    #[test]
    fn test_enter_then_leave_is_persisted() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        let entered = pipeline.process(&phone(t0())).unwrap().unwrap();
        assert_eq!(entered.kind, TransitionKind::Enter);
        assert!(pipeline.process(&phone(secs(10))).unwrap().is_none());

        let report = pipeline.sweep(secs(40));
        assert_eq!(report.left, 1);
        assert!(report.failed.is_empty());

        let events: Vec<PresenceEvent> = pipeline.history().query().run().unwrap().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, secs(10));

        let daily = pipeline.daily(&entered.fingerprint, t0().date_naive()).unwrap();
        assert_eq!(daily.dwell_ms, 10_000);
        assert_eq!(daily.enter_count, 1);
        assert_eq!(pipeline.metrics().enters_total(), 1);
        assert_eq!(pipeline.metrics().leaves_total(), 1);
    }

    #[test]
    fn test_anonymous_is_suppressed() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let silent = Observation::new("AA:BB:CC:DD:EE:02", t0()).with_rssi(-80);
        assert!(pipeline.process(&silent).unwrap().is_none());
        assert!(pipeline.tracker().is_empty());
        assert_eq!(pipeline.metrics().anonymous_suppressed(), 1);
    }

    #[test]
    fn test_malformed_raw_is_dropped() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let result = pipeline.ingest(RawObservation::default(), t0()).unwrap();
        assert!(result.is_none());
        assert_eq!(pipeline.metrics().observations_dropped(), 1);
    }

    #[test]
    fn test_persist_failure_still_advances_state() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        pipeline.history().set_fail_appends(true);
        let err = pipeline.process(&phone(t0())).unwrap_err();
        assert!(matches!(err.record, HistoryRecord::Event(ref e) if e.kind == TransitionKind::Enter));
        assert_eq!(pipeline.tracker().present_count(), 1);
        assert_eq!(pipeline.metrics().history_append_failures(), 1);

        pipeline.history().set_fail_appends(false);
        let report = pipeline.sweep(secs(30));
        assert_eq!(report.left, 1);
        assert!(report.failed.is_empty());

        let records = pipeline.history().records().unwrap();
        assert!(matches!(records[0], HistoryRecord::Discontinuity { lost: 1, .. }));
        assert!(matches!(records[1], HistoryRecord::Event(ref e) if e.kind == TransitionKind::Leave));
    }

    #[test]
    fn test_midnight_crossing_is_split() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        let before = Utc.with_ymd_and_hms(2026, 1, 5, 23, 59, 50).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 10).unwrap();

        let entered = pipeline.process(&phone(before)).unwrap().unwrap();
        pipeline.process(&phone(after)).unwrap();
        pipeline.sweep(after + TimeDelta::seconds(30));

        let day1 = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 1, 6).unwrap();
        assert_eq!(pipeline.daily(&entered.fingerprint, day1).unwrap().dwell_ms, 10_000);
        assert_eq!(pipeline.daily(&entered.fingerprint, day2).unwrap().dwell_ms, 10_000);

        // The first day was sealed once the interval closed
        let sealed: Vec<HistoryRecord> = pipeline
            .history()
            .records()
            .unwrap()
            .into_iter()
            .filter(|r| matches!(r, HistoryRecord::Daily(d) if d.sealed))
            .collect();
        assert_eq!(sealed.len(), 1);
    }

    #[test]
    fn test_flush_writes_pending_snapshots() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        pipeline.process(&phone(t0())).unwrap();
        pipeline.process(&phone(secs(4)).with_name("Pixel")).unwrap();
        assert_eq!(pipeline.flush().unwrap(), 1);

        let records = pipeline.history().records().unwrap();
        assert!(matches!(records.last(), Some(HistoryRecord::Daily(d)) if !d.sealed));
        let device = records
            .iter()
            .find_map(|r| match r {
                HistoryRecord::Device(device) => Some(device),
                _ => None,
            })
            .unwrap();
        assert_eq!(device.seen_count, 2);
        assert_eq!(device.last_seen, secs(4));
        assert_eq!(device.names, vec!["Pixel".to_string()]);
        assert_eq!(device.vendor, "apple");
    }

    #[test]
    fn test_leave_writes_device_snapshot() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);
        pipeline.process(&phone(t0())).unwrap();
        pipeline.sweep(secs(30));

        let records = pipeline.history().records().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[1], HistoryRecord::Event(ref e) if e.kind == TransitionKind::Leave));
        match &records[2] {
            HistoryRecord::Device(device) => {
                assert_eq!(device.leave_count, 1);
                assert_eq!(device.addresses, vec!["AA:BB:CC:DD:EE:01".to_string()]);
                assert!(!device.material.is_empty());
            }
            other => panic!("expected device snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_sweep_clock_follows_observation_time() {
        let mut clock = SweepClock::default();
        let behind = Utc::now() - TimeDelta::seconds(45);
        clock.observe(behind);
        let now = clock.now();
        assert!(now >= behind && now < behind + TimeDelta::seconds(5));

        // Older observations never move it back
        clock.observe(behind - TimeDelta::seconds(10));
        assert!(clock.now() >= now);
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(pipeline(&dir));
        let (obs_tx, obs_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let now = Utc::now();
        obs_tx.send(phone(now)).await.unwrap();
        obs_tx.send(phone(now + TimeDelta::seconds(1))).await.unwrap();

        let runner = pipeline.clone();
        let task = tokio::spawn(async move { runner.run(obs_rx, shutdown_rx).await });
        drop(obs_tx);
        task.await.unwrap();
        drop(shutdown_tx);

        assert_eq!(pipeline.tracker().present_count(), 1);
        assert_eq!(pipeline.metrics().observations_total(), 2);
    }
}
