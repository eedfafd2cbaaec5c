//! Long-lived per-device state and daily dwell aggregates

use crate::domain::types::{
    Classification, Fingerprint, FingerprintId, FingerprintMaterial, PresenceState,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

/// Addresses remembered per device (rotating addresses would grow unbounded)
pub const MAX_ADDRESSES: usize = 16;
/// Local names remembered per device
pub const MAX_NAMES: usize = 8;

/// An interval split at UTC midnights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySplit {
    pub parts: SmallVec<[(NaiveDate, u64); 2]>,
    /// End preceded start; the interval was clamped to zero
    pub clamped: bool,
}

/// Split `[start, end]` into per-day millisecond shares.
///
/// A backwards interval yields a single zero-length share on the start
/// date with `clamped` set.
pub fn split_by_day(start: DateTime<Utc>, end: DateTime<Utc>) -> DaySplit {
    if end < start {
        return DaySplit { parts: smallvec![(start.date_naive(), 0)], clamped: true };
    }

    let mut parts: SmallVec<[(NaiveDate, u64); 2]> = SmallVec::new();
    let mut cursor = start;
    loop {
        let day = cursor.date_naive();
        let next_midnight =
            day.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| dt.and_utc());
        match next_midnight {
            Some(midnight) if end > midnight => {
                parts.push((day, (midnight - cursor).num_milliseconds().max(0) as u64));
                cursor = midnight;
            }
            _ => {
                parts.push((day, (end - cursor).num_milliseconds().max(0) as u64));
                break;
            }
        }
    }
    DaySplit { parts, clamped: false }
}

/// Per-fingerprint device state, owned by the presence tracker
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub fingerprint: FingerprintId,
    pub material: FingerprintMaterial,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: PresenceState,
    pub vendor: String,
    pub beacon: String,
    /// Day `dwell_today_ms` refers to
    pub dwell_day: Option<NaiveDate>,
    pub dwell_today_ms: u64,
    pub last_rssi: Option<i16>,
    pub best_rssi: Option<i16>,
    pub seen_count: u64,
    pub enter_count: u32,
    pub leave_count: u32,
    pub reenter_count: u32,
    pub last_enter: Option<DateTime<Utc>>,
    pub addresses: SmallVec<[String; 4]>,
    pub names: SmallVec<[String; 2]>,
}

impl DeviceRecord {
    pub fn new(fingerprint: &Fingerprint, labels: Classification, at: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.id.clone(),
            material: fingerprint.material.clone(),
            first_seen: at,
            last_seen: at,
            state: PresenceState::Absent,
            vendor: labels.vendor.to_string(),
            beacon: labels.beacon.to_string(),
            dwell_day: None,
            dwell_today_ms: 0,
            last_rssi: None,
            best_rssi: None,
            seen_count: 0,
            enter_count: 0,
            leave_count: 0,
            reenter_count: 0,
            last_enter: None,
            addresses: SmallVec::new(),
            names: SmallVec::new(),
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.state == PresenceState::Present
    }

    /// Absent devices are kept but considered stale
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.state == PresenceState::Absent
    }

    pub fn record_rssi(&mut self, rssi: Option<i16>) {
        self.last_rssi = rssi;
        if let Some(value) = rssi {
            if self.best_rssi.map_or(true, |best| value > best) {
                self.best_rssi = Some(value);
            }
        }
    }

    pub fn remember_address(&mut self, address: &str) {
        if self.addresses.len() < MAX_ADDRESSES && !self.addresses.iter().any(|a| a == address) {
            self.addresses.push(address.to_string());
        }
    }

    pub fn remember_name(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        if self.names.len() < MAX_NAMES && !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    /// Add a closed presence interval to the current-day dwell counter.
    /// Shares for days before the current one are ignored here; the
    /// daily aggregator keeps the full per-day history.
    pub fn credit_dwell(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        for (day, ms) in split_by_day(start, end).parts {
            match self.dwell_day {
                Some(current) if current == day => self.dwell_today_ms += ms,
                Some(current) if current > day => {}
                _ => {
                    self.dwell_day = Some(day);
                    self.dwell_today_ms = ms;
                }
            }
        }
    }

    /// Bookkeeping as written to history
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            fingerprint: self.fingerprint.clone(),
            material: self.material.clone(),
            vendor: self.vendor.clone(),
            beacon: self.beacon.clone(),
            state: self.state,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            last_rssi: self.last_rssi,
            best_rssi: self.best_rssi,
            seen_count: self.seen_count,
            enter_count: self.enter_count,
            leave_count: self.leave_count,
            reenter_count: self.reenter_count,
            addresses: self.addresses.to_vec(),
            names: self.names.to_vec(),
        }
    }

    /// Take bookkeeping back from a snapshot. Presence state stays as the
    /// replayed events left it; times only widen.
    pub fn apply_snapshot(&mut self, snapshot: &DeviceSnapshot) {
        if !snapshot.material.is_empty() {
            self.material = snapshot.material.clone();
        }
        self.vendor = snapshot.vendor.clone();
        self.beacon = snapshot.beacon.clone();
        self.first_seen = self.first_seen.min(snapshot.first_seen);
        self.last_seen = self.last_seen.max(snapshot.last_seen);
        self.last_rssi = snapshot.last_rssi.or(self.last_rssi);
        self.best_rssi = self.best_rssi.max(snapshot.best_rssi);
        self.seen_count = self.seen_count.max(snapshot.seen_count);
        self.enter_count = self.enter_count.max(snapshot.enter_count);
        self.leave_count = self.leave_count.max(snapshot.leave_count);
        self.reenter_count = self.reenter_count.max(snapshot.reenter_count);
        for address in &snapshot.addresses {
            self.remember_address(address);
        }
        for name in &snapshot.names {
            self.remember_name(name);
        }
    }

    /// Dwell accumulated on `today`, zero if nothing was credited that day
    pub fn dwell_on(&self, today: NaiveDate) -> u64 {
        if self.dwell_day == Some(today) {
            self.dwell_today_ms
        } else {
            0
        }
    }
}

/// Persisted form of a device's registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub fingerprint: FingerprintId,
    pub material: FingerprintMaterial,
    pub vendor: String,
    pub beacon: String,
    pub state: PresenceState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub last_rssi: Option<i16>,
    #[serde(default)]
    pub best_rssi: Option<i16>,
    pub seen_count: u64,
    pub enter_count: u32,
    pub leave_count: u32,
    pub reenter_count: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

/// Dwell total for one fingerprint on one UTC calendar date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub fingerprint: FingerprintId,
    pub date: NaiveDate,
    pub dwell_ms: u64,
    pub enter_count: u32,
    /// The date has fully elapsed and no open interval covers it
    #[serde(rename = "final", default)]
    pub sealed: bool,
}

impl DailyAggregate {
    pub fn new(fingerprint: FingerprintId, date: NaiveDate) -> Self {
        Self { fingerprint, date, dwell_ms: 0, enter_count: 0, sealed: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hh, mm, ss).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_split_within_one_day() {
        let split = split_by_day(at(2026, 1, 5, 10, 0, 0), at(2026, 1, 5, 10, 0, 10));
        assert!(!split.clamped);
        assert_eq!(split.parts.as_slice(), &[(date(2026, 1, 5), 10_000)]);
    }

    #[test]
    fn test_split_across_midnight() {
        let split = split_by_day(at(2026, 1, 5, 23, 59, 50), at(2026, 1, 6, 0, 0, 10));
        assert_eq!(
            split.parts.as_slice(),
            &[(date(2026, 1, 5), 10_000), (date(2026, 1, 6), 10_000)]
        );
    }

    #[test]
    fn test_split_spanning_full_day() {
        let split = split_by_day(at(2026, 1, 5, 23, 0, 0), at(2026, 1, 7, 1, 0, 0));
        assert_eq!(
            split.parts.as_slice(),
            &[
                (date(2026, 1, 5), 3_600_000),
                (date(2026, 1, 6), 86_400_000),
                (date(2026, 1, 7), 3_600_000)
            ]
        );
    }

    #[test]
    fn test_split_ending_exactly_at_midnight() {
        let split = split_by_day(at(2026, 1, 5, 23, 59, 0), at(2026, 1, 6, 0, 0, 0));
        assert_eq!(split.parts.as_slice(), &[(date(2026, 1, 5), 60_000)]);
    }

    #[test]
    fn test_split_backwards_is_clamped() {
        let split = split_by_day(at(2026, 1, 5, 10, 0, 10), at(2026, 1, 5, 10, 0, 0));
        assert!(split.clamped);
        assert_eq!(split.parts.as_slice(), &[(date(2026, 1, 5), 0)]);
    }

    fn record() -> DeviceRecord {
        let fp = Fingerprint {
            id: FingerprintId::from("abc"),
            version: "v1",
            material: FingerprintMaterial::default(),
        };
        DeviceRecord::new(&fp, Classification::UNKNOWN, at(2026, 1, 5, 0, 0, 0))
    }

    #[test]
    fn test_credit_dwell_resets_on_new_day() {
        let mut rec = record();
        rec.credit_dwell(at(2026, 1, 5, 10, 0, 0), at(2026, 1, 5, 10, 0, 30));
        rec.credit_dwell(at(2026, 1, 5, 11, 0, 0), at(2026, 1, 5, 11, 0, 30));
        assert_eq!(rec.dwell_on(date(2026, 1, 5)), 60_000);

        rec.credit_dwell(at(2026, 1, 5, 23, 59, 50), at(2026, 1, 6, 0, 0, 10));
        assert_eq!(rec.dwell_on(date(2026, 1, 6)), 10_000);
        assert_eq!(rec.dwell_on(date(2026, 1, 5)), 0);
    }

    #[test]
    fn test_address_list_is_bounded() {
        let mut rec = record();
        for i in 0..40 {
            rec.remember_address(&format!("AA:BB:CC:DD:EE:{:02X}", i));
        }
        rec.remember_address("AA:BB:CC:DD:EE:00");
        assert_eq!(rec.addresses.len(), MAX_ADDRESSES);
    }

    #[test]
    fn test_snapshot_restores_bookkeeping() {
        let mut rec = record();
        rec.vendor = "apple".to_string();
        rec.material.manufacturer_ids = vec![0x004C];
        rec.remember_address("AA:BB:CC:DD:EE:01");
        rec.remember_name("Keys");
        rec.record_rssi(Some(-58));
        rec.seen_count = 12;
        rec.enter_count = 3;
        rec.leave_count = 2;
        rec.reenter_count = 2;
        rec.last_seen = at(2026, 1, 5, 9, 0, 0);

        let json = serde_json::to_value(rec.snapshot()).unwrap();
        assert_eq!(json["state"], "ABSENT");
        assert_eq!(json["addresses"][0], "AA:BB:CC:DD:EE:01");
        let snapshot: DeviceSnapshot = serde_json::from_value(json).unwrap();

        let mut restored = record();
        restored.enter_count = 1;
        restored.apply_snapshot(&snapshot);
        assert_eq!(restored.vendor, "apple");
        assert_eq!(restored.material.manufacturer_ids, vec![0x004C]);
        assert_eq!(restored.names.as_slice(), &["Keys".to_string()]);
        assert_eq!(restored.best_rssi, Some(-58));
        assert_eq!(restored.seen_count, 12);
        assert_eq!(restored.enter_count, 3);
        assert_eq!(restored.last_seen, at(2026, 1, 5, 9, 0, 0));
        assert_eq!(restored.state, PresenceState::Absent);
    }

    #[test]
    fn test_best_rssi_tracks_maximum() {
        let mut rec = record();
        rec.record_rssi(Some(-80));
        rec.record_rssi(Some(-55));
        rec.record_rssi(Some(-70));
        rec.record_rssi(None);
        assert_eq!(rec.best_rssi, Some(-55));
        assert_eq!(rec.last_rssi, None);
    }
}
