//! Rebuild in-memory state from the event history
//!
//! Events are replayed in append order, which is per-fingerprint event
//! order. Device records get their counters and last known state back;
//! daily aggregates are recomputed from the events. A device whose last
//! event is ENTER comes back PRESENT with last-seen at the ENTER time, so
//! the first sweep closes it unless it is sighted again. `device` snapshots
//! bring back the registry bookkeeping (labels, material, addresses, names,
//! counters) and the last sighting time known when they were written.

use crate::domain::device::DeviceRecord;
use crate::domain::types::{
    Classification, Fingerprint, FingerprintId, FingerprintMaterial, PresenceEvent, PresenceState,
    TransitionKind,
};
use crate::io::history::HistoryRecord;
use crate::services::aggregator::DailyAggregator;
use crate::services::fingerprint::FingerprintVersion;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{info, warn};

/// Why the history is known to be incomplete at some point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapKind {
    /// Appends failed; `lost` records were never written
    Discontinuity { lost: u64, since: DateTime<Utc> },
    /// ENTER while the device was already present
    RepeatedEnter,
    /// LEAVE while the device was already absent
    RepeatedLeave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryGap {
    pub fingerprint: Option<FingerprintId>,
    pub at: DateTime<Utc>,
    pub kind: GapKind,
}

/// State rebuilt from a history replay
pub struct Recovered {
    pub devices: Vec<DeviceRecord>,
    pub aggregator: DailyAggregator,
    pub gaps: Vec<HistoryGap>,
    pub sessions: usize,
    pub events: usize,
}

impl Recovered {
    pub fn present_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_present()).count()
    }
}

/// Replay history records into device records and aggregates
pub fn replay(
    records: &[HistoryRecord],
    version: FingerprintVersion,
    retention_days: u32,
) -> Recovered {
    let mut devices: FxHashMap<FingerprintId, DeviceRecord> = FxHashMap::default();
    let mut aggregator = DailyAggregator::new(retention_days);
    let mut gaps = Vec::new();
    let mut sessions = 0;
    let mut events = 0;

    for record in records {
        match record {
            HistoryRecord::Session { fingerprint_version, started_at, .. } => {
                sessions += 1;
                if fingerprint_version != version.as_str() {
                    warn!(
                        recorded = %fingerprint_version,
                        configured = %version.as_str(),
                        started_at = %started_at,
                        "history_fingerprint_version_mismatch"
                    );
                }
            }
            HistoryRecord::Event(event) => {
                events += 1;
                let device = devices
                    .entry(event.fingerprint.clone())
                    .or_insert_with(|| blank_record(&event.fingerprint, version, event.timestamp));
                if let Some(kind) = apply_event(device, event) {
                    gaps.push(HistoryGap {
                        fingerprint: Some(event.fingerprint.clone()),
                        at: event.timestamp,
                        kind,
                    });
                }
                aggregator.apply(event);
            }
            HistoryRecord::Device(snapshot) => {
                let id = &snapshot.fingerprint;
                devices
                    .entry(id.clone())
                    .or_insert_with(|| blank_record(id, version, snapshot.first_seen))
                    .apply_snapshot(snapshot);
            }
            HistoryRecord::Daily(_) => {}
            HistoryRecord::Discontinuity { since, until, lost } => {
                gaps.push(HistoryGap {
                    fingerprint: None,
                    at: *until,
                    kind: GapKind::Discontinuity { lost: *lost, since: *since },
                });
            }
        }
    }

    let mut devices: Vec<DeviceRecord> = devices.into_values().collect();
    devices.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    let recovered = Recovered { devices, aggregator, gaps, sessions, events };
    info!(
        sessions = %recovered.sessions,
        events = %recovered.events,
        devices = %recovered.devices.len(),
        present = %recovered.present_count(),
        gaps = %recovered.gaps.len(),
        "history_replayed"
    );
    recovered
}

fn blank_record(id: &FingerprintId, version: FingerprintVersion, at: DateTime<Utc>) -> DeviceRecord {
    let fingerprint = Fingerprint {
        id: id.clone(),
        version: version.as_str(),
        material: FingerprintMaterial::default(),
    };
    DeviceRecord::new(&fingerprint, Classification::UNKNOWN, at)
}

/// Apply one event to a record; returns the gap it reveals, if any
fn apply_event(device: &mut DeviceRecord, event: &PresenceEvent) -> Option<GapKind> {
    device.first_seen = device.first_seen.min(event.timestamp);
    device.last_seen = device.last_seen.max(event.timestamp);
    device.record_rssi(event.rssi);

    match (event.kind, device.state) {
        (TransitionKind::Enter, PresenceState::Present) => Some(GapKind::RepeatedEnter),
        (TransitionKind::Enter, PresenceState::Absent) => {
            if device.leave_count > 0 {
                device.reenter_count += 1;
            }
            device.state = PresenceState::Present;
            device.enter_count += 1;
            device.last_enter = Some(event.timestamp);
            None
        }
        (TransitionKind::Leave, PresenceState::Absent) => Some(GapKind::RepeatedLeave),
        (TransitionKind::Leave, PresenceState::Present) => {
            device.state = PresenceState::Absent;
            device.leave_count += 1;
            if let Some(entered) = device.last_enter {
                device.credit_dwell(entered, event.timestamp);
            }
            None
        }
    }
}
