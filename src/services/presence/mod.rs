//! Presence state machine and device table
//!
//! Each fingerprint is ABSENT or PRESENT:
//! - ABSENT + sighting -> PRESENT, emits ENTER
//! - PRESENT + sighting -> PRESENT, refreshes last-seen (debounce, no event)
//! - PRESENT + tick with `now - last_seen >= timeout` -> ABSENT, emits LEAVE
//!   stamped with the last sighting, not the tick time
//! - ABSENT + tick -> nothing
//!
//! The device table maps fingerprint to an individually locked record.
//! Callers receive transitions inside a callback that runs while the
//! record's lock is held, so everything downstream of the tracker sees a
//! fingerprint's ENTER/LEAVE sequence in the order it was produced.

#[cfg(test)]
mod tests;

use crate::domain::device::DeviceRecord;
use crate::domain::types::{
    Classification, Fingerprint, FingerprintId, Observation, PresenceEvent, PresenceState,
};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Input to the per-device state machine
#[derive(Debug, Clone, Copy)]
pub enum PresenceInput<'a> {
    /// A normalized advertisement for this device
    Sighting(&'a Observation),
    /// Liveness check at the given time
    Tick(DateTime<Utc>),
}

/// Outcome of one state machine step
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: Option<PresenceEvent>,
    /// The sighting was older than the last one and was clamped
    pub clock_anomaly: bool,
}

/// The only place a `DeviceRecord` changes state.
pub fn transition(
    record: &mut DeviceRecord,
    input: PresenceInput<'_>,
    absence_timeout: TimeDelta,
) -> Transition {
    match input {
        PresenceInput::Sighting(observation) => {
            let clock_anomaly = observation.observed_at < record.last_seen;
            let at = observation.observed_at.max(record.last_seen);

            record.last_seen = at;
            record.seen_count += 1;
            record.record_rssi(observation.rssi);
            record.remember_address(&observation.address);
            if let Some(name) = observation.local_name.as_deref() {
                record.remember_name(name);
            }

            let event = match record.state {
                PresenceState::Present => None,
                PresenceState::Absent => {
                    if record.leave_count > 0 {
                        record.reenter_count += 1;
                    }
                    record.state = PresenceState::Present;
                    record.enter_count += 1;
                    record.last_enter = Some(at);
                    Some(PresenceEvent::enter(record.fingerprint.clone(), at, observation.rssi))
                }
            };
            Transition { event, clock_anomaly }
        }
        PresenceInput::Tick(now) => {
            if record.state != PresenceState::Present
                || now.signed_duration_since(record.last_seen) < absence_timeout
            {
                return Transition { event: None, clock_anomaly: false };
            }

            record.state = PresenceState::Absent;
            record.leave_count += 1;
            if let Some(entered) = record.last_enter {
                record.credit_dwell(entered, record.last_seen);
            }
            let event = PresenceEvent::leave(
                record.fingerprint.clone(),
                record.last_seen,
                record.last_rssi,
                now,
            );
            Transition { event: Some(event), clock_anomaly: false }
        }
    }
}

/// Shared handle to one device's record
type DeviceEntry = Arc<Mutex<DeviceRecord>>;

/// Owned device table with per-fingerprint mutual exclusion
pub struct PresenceTracker {
    devices: RwLock<FxHashMap<FingerprintId, DeviceEntry>>,
    absence_timeout: TimeDelta,
}

impl PresenceTracker {
    pub fn new(absence_timeout: Duration) -> Self {
        let absence_timeout =
            TimeDelta::from_std(absence_timeout).unwrap_or_else(|_| TimeDelta::days(36_500));
        Self { devices: RwLock::new(FxHashMap::default()), absence_timeout }
    }

    pub fn absence_timeout(&self) -> TimeDelta {
        self.absence_timeout
    }

    /// Get or create the entry for a fingerprint. The map lock is never
    /// held while a record lock is taken.
    fn entry(
        &self,
        fingerprint: &Fingerprint,
        labels: Classification,
        at: DateTime<Utc>,
    ) -> DeviceEntry {
        if let Some(entry) = self.devices.read().get(&fingerprint.id) {
            return entry.clone();
        }
        let mut devices = self.devices.write();
        devices
            .entry(fingerprint.id.clone())
            .or_insert_with(|| {
                debug!(fingerprint = %fingerprint.id, vendor = %labels.vendor, "device_discovered");
                Arc::new(Mutex::new(DeviceRecord::new(fingerprint, labels, at)))
            })
            .clone()
    }

    /// Apply a sighting.
    ///
    /// `on_transition` is called with the ENTER event (if any) while the
    /// device lock is held; its result is returned alongside the transition.
    pub fn observe<F, R>(
        &self,
        fingerprint: &Fingerprint,
        labels: Classification,
        observation: &Observation,
        on_transition: F,
    ) -> (Transition, Option<R>)
    where
        F: FnOnce(&PresenceEvent, &DeviceRecord) -> R,
    {
        let entry = self.entry(fingerprint, labels, observation.observed_at);
        let mut record = entry.lock();

        // Records restored without a device snapshot carry no material or labels
        if record.material.is_empty() && !fingerprint.material.is_empty() {
            record.material = fingerprint.material.clone();
        }
        // Labels can sharpen once a more telling payload shows up
        if record.vendor == Classification::UNKNOWN.vendor && labels.has_vendor() {
            record.vendor = labels.vendor.to_string();
        }
        if record.beacon == Classification::UNKNOWN.beacon
            && labels.beacon != Classification::UNKNOWN.beacon
        {
            record.beacon = labels.beacon.to_string();
        }

        let step =
            transition(&mut *record, PresenceInput::Sighting(observation), self.absence_timeout);
        if step.clock_anomaly {
            warn!(
                fingerprint = %fingerprint.id,
                observed_at = %observation.observed_at,
                last_seen = %record.last_seen,
                "sighting_clock_went_backwards"
            );
        }

        let outcome = step.event.as_ref().map(|event| {
            info!(
                fingerprint = %record.fingerprint,
                vendor = %record.vendor,
                beacon = %record.beacon,
                rssi = ?event.rssi,
                address = %observation.address,
                enter_count = %record.enter_count,
                "device_entered"
            );
            on_transition(event, &*record)
        });
        (step, outcome)
    }

    /// Run the absence check over a snapshot of the table.
    ///
    /// Each record is locked individually; `on_transition` is called for
    /// every LEAVE while that record's lock is held. Returns the number of
    /// devices that left.
    pub fn sweep<F>(&self, now: DateTime<Utc>, mut on_transition: F) -> usize
    where
        F: FnMut(&PresenceEvent, &DeviceRecord),
    {
        let snapshot: Vec<DeviceEntry> = self.devices.read().values().cloned().collect();
        let mut left = 0;
        for entry in snapshot {
            let mut record = entry.lock();
            let step = transition(&mut *record, PresenceInput::Tick(now), self.absence_timeout);
            if let Some(event) = step.event {
                left += 1;
                info!(
                    fingerprint = %record.fingerprint,
                    last_seen = %record.last_seen,
                    dwell_today_ms = %record.dwell_today_ms,
                    "device_left"
                );
                on_transition(&event, &*record);
            }
        }
        left
    }

    /// Insert a record rebuilt from history, replacing any existing one
    pub fn restore(&self, record: DeviceRecord) {
        self.devices.write().insert(record.fingerprint.clone(), Arc::new(Mutex::new(record)));
    }

    /// Copy of a device's current record
    pub fn get(&self, fingerprint: &FingerprintId) -> Option<DeviceRecord> {
        let entry = self.devices.read().get(fingerprint).cloned()?;
        let record = entry.lock().clone();
        Some(record)
    }

    /// Copies of all records
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let entries: Vec<DeviceEntry> = self.devices.read().values().cloned().collect();
        entries.iter().map(|entry| entry.lock().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn present_count(&self) -> usize {
        let entries: Vec<DeviceEntry> = self.devices.read().values().cloned().collect();
        entries.iter().filter(|entry| entry.lock().is_present()).count()
    }
}
