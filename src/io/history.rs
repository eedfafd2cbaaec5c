//! Event history store - append-only JSONL ledger
//!
//! Every line is one `HistoryRecord`, internally tagged by `record`:
//!
//! ```text
//! {"record":"session","session_id":"...","started_at":"...","site":"...","fingerprint_version":"v1"}
//! {"record":"event","fingerprint":"3f2a...","kind":"ENTER","timestamp":"...","rssi":-61}
//! {"record":"daily","fingerprint":"3f2a...","date":"2026-01-05","dwell_ms":10000,"enter_count":1,"final":true}
//! {"record":"device","fingerprint":"3f2a...","vendor":"apple","state":"ABSENT","seen_count":42,...}
//! {"record":"discontinuity","since":"...","until":"...","lost":2}
//! ```
//!
//! Appends are serialized by a mutex. Readers only see the committed prefix,
//! which always ends on a line boundary. A torn trailing line left by a
//! crash is truncated on open.

use crate::domain::device::{DailyAggregate, DeviceSnapshot};
use crate::domain::types::{FingerprintId, PresenceEvent};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use tracing::{debug, error, info, warn};

/// One line of the history file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HistoryRecord {
    /// Written once per process start
    Session {
        session_id: String,
        started_at: DateTime<Utc>,
        site: String,
        fingerprint_version: String,
    },
    Event(PresenceEvent),
    Daily(DailyAggregate),
    /// Registry entry of one device, written on LEAVE and on flush
    Device(DeviceSnapshot),
    /// Records between `since` and `until` could not be written
    Discontinuity { since: DateTime<Utc>, until: DateTime<Utc>, lost: u64 },
}

impl HistoryRecord {
    /// Time the record refers to
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryRecord::Session { started_at, .. } => *started_at,
            HistoryRecord::Event(event) => event.timestamp,
            HistoryRecord::Daily(daily) => daily.date.and_time(NaiveTime::MIN).and_utc(),
            HistoryRecord::Device(device) => device.last_seen,
            HistoryRecord::Discontinuity { until, .. } => *until,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HistoryRecord::Session { .. } => "session",
            HistoryRecord::Event(_) => "event",
            HistoryRecord::Daily(_) => "daily",
            HistoryRecord::Device(_) => "device",
            HistoryRecord::Discontinuity { .. } => "discontinuity",
        }
    }
}

/// A record that could not be persisted
#[derive(Debug)]
pub struct PersistError {
    pub record: HistoryRecord,
    pub source: anyhow::Error,
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to persist {} record: {:#}", self.record.kind(), self.source)
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Records lost since the last successful append
#[derive(Debug, Clone, Copy)]
struct Gap {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    lost: u64,
}

struct Writer {
    file: File,
    gap: Option<Gap>,
}

pub struct EventHistoryStore {
    path: PathBuf,
    writer: Mutex<Writer>,
    /// Length of the complete-line prefix visible to readers
    committed: AtomicU64,
    #[cfg(test)]
    fail_appends: AtomicBool,
}

impl EventHistoryStore {
    /// Open (or create) a history file, dropping a torn trailing line
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create history directory {}", parent.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open history file {}", path.display()))?;

        let committed = complete_prefix_len(&file)
            .with_context(|| format!("Failed to scan history file {}", path.display()))?;
        let len = file.metadata()?.len();
        if committed < len {
            warn!(
                file = %path.display(),
                torn_bytes = %(len - committed),
                "history_torn_tail_truncated"
            );
            file.set_len(committed)
                .with_context(|| format!("Failed to truncate history file {}", path.display()))?;
        }

        info!(file = %path.display(), bytes = %committed, "history_opened");

        Ok(Self {
            path,
            writer: Mutex::new(Writer { file, gap: None }),
            committed: AtomicU64::new(committed),
            #[cfg(test)]
            fail_appends: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes visible to readers
    pub fn committed_len(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Whether appends failed since the last successful one
    pub fn has_gap(&self) -> bool {
        self.writer.lock().gap.is_some()
    }

    /// Append one record. A pending gap is recorded as a `discontinuity`
    /// line before the record itself.
    pub fn append(&self, record: &HistoryRecord) -> Result<(), PersistError> {
        let mut writer = self.writer.lock();
        let at = record.timestamp();

        if let Some(gap) = writer.gap {
            let marker = HistoryRecord::Discontinuity {
                since: gap.since,
                until: at.max(gap.until),
                lost: gap.lost,
            };
            if let Err(source) = self.write_line(&mut writer.file, &marker) {
                return Err(self.fail(&mut writer, record, source));
            }
            warn!(since = %gap.since, until = %at, lost = %gap.lost, "history_discontinuity_recorded");
            writer.gap = None;
        }

        match self.write_line(&mut writer.file, record) {
            Ok(bytes) => {
                debug!(record = %record.kind(), bytes = %bytes, "history_appended");
                Ok(())
            }
            Err(source) => Err(self.fail(&mut writer, record, source)),
        }
    }

    fn fail(&self, writer: &mut Writer, record: &HistoryRecord, source: anyhow::Error) -> PersistError {
        let at = record.timestamp();
        let gap = match writer.gap {
            Some(gap) => Gap { since: gap.since.min(at), until: gap.until.max(at), lost: gap.lost + 1 },
            None => Gap { since: at, until: at, lost: 1 },
        };
        writer.gap = Some(gap);
        error!(
            file = %self.path.display(),
            record = %record.kind(),
            lost = %gap.lost,
            error = %format!("{:#}", source),
            "history_append_failed"
        );
        PersistError { record: record.clone(), source }
    }

    /// Write one line and advance the committed prefix. A partial write is
    /// rolled back so the file keeps ending on a line boundary.
    fn write_line(&self, file: &mut File, record: &HistoryRecord) -> anyhow::Result<usize> {
        #[cfg(test)]
        if self.fail_appends.load(Ordering::Relaxed) {
            anyhow::bail!("injected append failure");
        }

        let mut line = serde_json::to_vec(record).context("Failed to serialize history record")?;
        line.push(b'\n');

        if let Err(e) = file.write_all(&line) {
            let committed = self.committed.load(Ordering::Acquire);
            if let Err(rollback) = file.set_len(committed) {
                error!(error = %rollback, "history_rollback_failed");
            }
            return Err(e).with_context(|| format!("Failed to append to {}", self.path.display()));
        }

        self.committed.fetch_add(line.len() as u64, Ordering::AcqRel);
        Ok(line.len())
    }

    /// Flush written records to stable storage
    pub fn sync(&self) -> anyhow::Result<()> {
        let writer = self.writer.lock();
        writer
            .file
            .sync_data()
            .with_context(|| format!("Failed to sync history file {}", self.path.display()))
    }

    /// All committed records in append order
    pub fn records(&self) -> anyhow::Result<Vec<HistoryRecord>> {
        read_prefix(&self.path, self.committed_len())
    }

    /// Build a query over presence events
    pub fn query(&self) -> EventQuery {
        EventQuery {
            path: self.path.clone(),
            limit: self.committed_len(),
            fingerprint: None,
            from: None,
            to: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::Relaxed);
    }
}

/// Lazy, restartable query over the committed history prefix.
///
/// Nothing is read until `run` is called; each call re-reads the file up to
/// the prefix captured when the query was built. Lines are streamed and
/// only matching events are held, but those are buffered for sorting:
/// append order is not timestamp order, since a LEAVE is stamped with its
/// last sighting.
#[derive(Debug, Clone)]
pub struct EventQuery {
    path: PathBuf,
    limit: u64,
    fingerprint: Option<FingerprintId>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

impl EventQuery {
    pub fn fingerprint(mut self, fingerprint: &FingerprintId) -> Self {
        self.fingerprint = Some(fingerprint.clone());
        self
    }

    /// Restrict to events whose UTC date lies within `[from, to]`
    pub fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    fn matches(&self, event: &PresenceEvent) -> bool {
        let date = event.timestamp.date_naive();
        self.fingerprint.as_ref().map_or(true, |fp| *fp == event.fingerprint)
            && self.from.map_or(true, |from| date >= from)
            && self.to.map_or(true, |to| date <= to)
    }

    /// Matching events in timestamp order (append order for ties)
    pub fn run(&self) -> anyhow::Result<std::vec::IntoIter<PresenceEvent>> {
        let mut events = Vec::new();
        scan_prefix(&self.path, self.limit, |record| {
            if let HistoryRecord::Event(event) = record {
                if self.matches(&event) {
                    events.push(event);
                }
            }
        })?;
        // Stable: ties keep append order
        events.sort_by_key(|event| event.timestamp);
        Ok(events.into_iter())
    }
}

/// Read every complete record of a history file (used by offline tools)
pub fn read_history<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<HistoryRecord>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open history file {}", path.display()))?;
    let limit = complete_prefix_len(&file)?;
    read_prefix(path, limit)
}

fn read_prefix(path: &Path, limit: u64) -> anyhow::Result<Vec<HistoryRecord>> {
    let mut records = Vec::new();
    scan_prefix(path, limit, |record| records.push(record))?;
    Ok(records)
}

/// Stream the records of the first `limit` bytes, one line at a time
fn scan_prefix<F>(path: &Path, limit: u64, mut visit: F) -> anyhow::Result<()>
where
    F: FnMut(HistoryRecord),
{
    let file = File::open(path)
        .with_context(|| format!("Failed to open history file {}", path.display()))?;
    let reader = BufReader::new(file.take(limit));

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(record) => visit(record),
            Err(e) => warn!(line = %(index + 1), error = %e, "history_line_skipped"),
        }
    }
    Ok(())
}

/// Length of the prefix that ends with the last newline
fn complete_prefix_len(file: &File) -> anyhow::Result<u64> {
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut complete = 0u64;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            complete += n as u64;
        } else {
            break;
        }
    }
    Ok(complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TransitionKind;
    use chrono::{TimeDelta, TimeZone};
    use std::fs;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    fn enter(fp: &str, secs: i64) -> HistoryRecord {
        HistoryRecord::Event(PresenceEvent::enter(
            FingerprintId::from(fp),
            t0() + TimeDelta::seconds(secs),
            Some(-60),
        ))
    }

    fn leave(fp: &str, secs: i64) -> HistoryRecord {
        let ts = t0() + TimeDelta::seconds(secs);
        HistoryRecord::Event(PresenceEvent::leave(
            FingerprintId::from(fp),
            ts,
            Some(-70),
            ts + TimeDelta::seconds(30),
        ))
    }

    #[test]
    fn test_append_writes_tagged_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/history.jsonl");
        let store = EventHistoryStore::open(&path).unwrap();

        store.append(&enter("abc", 0)).unwrap();
        let daily = DailyAggregate {
            fingerprint: FingerprintId::from("abc"),
            date: t0().date_naive(),
            dwell_ms: 10_000,
            enter_count: 1,
            sealed: true,
        };
        store.append(&HistoryRecord::Daily(daily)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record"], "event");
        assert_eq!(first["kind"], "ENTER");
        assert_eq!(first["fingerprint"], "abc");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"], "daily");
        assert_eq!(second["final"], true);
        assert_eq!(second["date"], "2026-01-05");
        assert_eq!(store.committed_len(), content.len() as u64);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        {
            let store = EventHistoryStore::open(&path).unwrap();
            store.append(&enter("abc", 0)).unwrap();
        }
        let intact = fs::read_to_string(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"event\",\"fingerp").unwrap();
        drop(file);

        let store = EventHistoryStore::open(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), intact);
        assert_eq!(store.records().unwrap().len(), 1);

        store.append(&leave("abc", 5)).unwrap();
        assert_eq!(store.records().unwrap().len(), 2);
    }

    #[test]
    fn test_query_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let store = EventHistoryStore::open(dir.path().join("history.jsonl")).unwrap();

        store.append(&enter("a", 10)).unwrap();
        store.append(&enter("b", 0)).unwrap();
        store.append(&leave("b", 5)).unwrap();
        store.append(&leave("a", 20)).unwrap();
        store.append(&enter("a", 86_400)).unwrap();

        let all: Vec<PresenceEvent> = store.query().run().unwrap().collect();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let only_a: Vec<PresenceEvent> =
            store.query().fingerprint(&FingerprintId::from("a")).run().unwrap().collect();
        assert_eq!(only_a.len(), 3);

        let day = t0().date_naive();
        let first_day: Vec<PresenceEvent> = store
            .query()
            .fingerprint(&FingerprintId::from("a"))
            .between(day, day)
            .run()
            .unwrap()
            .collect();
        assert_eq!(first_day.len(), 2);
        assert_eq!(first_day[1].kind, TransitionKind::Leave);
    }

    #[test]
    fn test_query_is_lazy_and_restartable() {
        let dir = tempdir().unwrap();
        let store = EventHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        store.append(&enter("a", 0)).unwrap();

        let query = store.query();
        // Appends after the query was built are outside its prefix
        store.append(&leave("a", 1)).unwrap();

        assert_eq!(query.run().unwrap().count(), 1);
        assert_eq!(query.run().unwrap().count(), 1);
        assert_eq!(store.query().run().unwrap().count(), 2);
    }

    #[test]
    fn test_query_keeps_append_order_for_ties() {
        let dir = tempdir().unwrap();
        let store = EventHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        store.append(&enter("a", 5)).unwrap();
        store.append(&HistoryRecord::Discontinuity { since: t0(), until: t0(), lost: 1 }).unwrap();
        store.append(&leave("b", 5)).unwrap();
        store.append(&enter("c", 5)).unwrap();

        let order: Vec<String> =
            store.query().run().unwrap().map(|e| e.fingerprint.to_string()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_queries_see_committed_prefix_during_appends() {
        let dir = tempdir().unwrap();
        let store = EventHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        const APPENDS: i64 = 400;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..APPENDS {
                    store.append(&enter("a", i)).unwrap();
                }
            });
            for _ in 0..3 {
                scope.spawn(|| {
                    let mut seen = 0;
                    while seen < APPENDS as usize {
                        let events: Vec<PresenceEvent> = store.query().run().unwrap().collect();
                        // Always a complete prefix of what was appended
                        assert!(events.len() >= seen);
                        for (i, event) in events.iter().enumerate() {
                            assert_eq!(event.timestamp, t0() + TimeDelta::seconds(i as i64));
                        }
                        seen = events.len();
                    }
                });
            }
        });

        assert_eq!(store.query().run().unwrap().count(), APPENDS as usize);
    }

    #[test]
    fn test_failed_appends_leave_discontinuity() {
        let dir = tempdir().unwrap();
        let store = EventHistoryStore::open(dir.path().join("history.jsonl")).unwrap();
        store.append(&enter("a", 0)).unwrap();

        store.set_fail_appends(true);
        let err = store.append(&leave("a", 10)).unwrap_err();
        assert_eq!(err.record, leave("a", 10));
        assert!(store.append(&enter("a", 20)).is_err());
        assert!(store.has_gap());

        store.set_fail_appends(false);
        store.append(&leave("a", 30)).unwrap();
        assert!(!store.has_gap());

        let records = store.records().unwrap();
        assert_eq!(records.len(), 3);
        match &records[1] {
            HistoryRecord::Discontinuity { since, until, lost } => {
                assert_eq!(*since, t0() + TimeDelta::seconds(10));
                assert_eq!(*until, t0() + TimeDelta::seconds(30));
                assert_eq!(*lost, 2);
            }
            other => panic!("expected discontinuity, got {:?}", other),
        }
        assert_eq!(records[2], leave("a", 30));
    }

    #[test]
    fn test_read_history_ignores_partial_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = EventHistoryStore::open(&path).unwrap();
        store.append(&enter("a", 0)).unwrap();
        drop(store);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":").unwrap();
        drop(file);

        assert_eq!(read_history(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_session_record_round_trips() {
        let record = HistoryRecord::Session {
            session_id: "0190".to_string(),
            started_at: t0(),
            site: "lab".to_string(),
            fingerprint_version: "v1".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with("{\"record\":\"session\""));
        let parsed: HistoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
