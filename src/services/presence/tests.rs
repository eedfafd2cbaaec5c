//! Tests for the presence state machine

use super::*;
use crate::domain::types::TransitionKind;
use crate::services::classifier::classify;
use crate::services::fingerprint::FingerprintEngine;
use chrono::TimeZone;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
}

fn secs(s: i64) -> DateTime<Utc> {
    t0() + TimeDelta::seconds(s)
}

/// Builder for test sightings of one device
fn sighting(at: DateTime<Utc>) -> Observation {
    Observation::new("AA:BB:CC:DD:EE:01", at)
        .with_manufacturer(0x004C, &[0x10, 0x05])
        .with_service_uuid("180F")
        .with_rssi(-60)
}

fn tracker(timeout_secs: u64) -> PresenceTracker {
    PresenceTracker::new(Duration::from_secs(timeout_secs))
}

/// Feed a sighting and collect any emitted event
fn observe(tracker: &PresenceTracker, obs: &Observation, events: &mut Vec<PresenceEvent>) {
    let fp = FingerprintEngine::default().fingerprint(obs);
    let (_, outcome) = tracker.observe(&fp, classify(obs), obs, |event, _| event.clone());
    events.extend(outcome);
}

fn sweep(tracker: &PresenceTracker, now: DateTime<Utc>, events: &mut Vec<PresenceEvent>) {
    tracker.sweep(now, |event, _| events.push(event.clone()));
}

#[test]
fn test_first_sighting_enters() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TransitionKind::Enter);
    assert_eq!(events[0].timestamp, t0());
    assert_eq!(events[0].rssi, Some(-60));

    let record = tracker.get(&events[0].fingerprint).unwrap();
    assert!(record.is_present());
    assert_eq!(record.first_seen, t0());
    assert_eq!(record.vendor, "apple");
    assert_eq!(tracker.present_count(), 1);
}

#[test]
fn test_debounce_many_sightings_one_enter() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    for i in 0..50 {
        observe(&tracker, &sighting(secs(i)), &mut events);
    }
    assert_eq!(events.len(), 1);
    let record = tracker.get(&events[0].fingerprint).unwrap();
    assert_eq!(record.seen_count, 50);
    assert_eq!(record.last_seen, secs(49));
}

#[test]
fn test_single_sighting_leaves_at_timeout_stamped_last_seen() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);

    sweep(&tracker, secs(29), &mut events);
    assert_eq!(events.len(), 1, "still inside the timeout window");

    sweep(&tracker, secs(30), &mut events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, TransitionKind::Leave);
    assert_eq!(events[1].timestamp, t0());
    assert_eq!(events[1].detected_at, Some(secs(30)));

    let record = tracker.get(&events[1].fingerprint).unwrap();
    assert!(record.is_stale());
    assert_eq!(record.dwell_today_ms, 0);
}

#[test]
fn test_leave_detected_after_last_sighting_plus_timeout() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    for s in [0, 5, 10] {
        observe(&tracker, &sighting(secs(s)), &mut events);
    }
    for s in 11..40 {
        sweep(&tracker, secs(s), &mut events);
    }
    assert_eq!(events.len(), 1);

    sweep(&tracker, secs(40), &mut events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].timestamp, secs(10));
    assert_eq!(events[1].detected_at, Some(secs(40)));

    let record = tracker.get(&events[1].fingerprint).unwrap();
    assert_eq!(record.dwell_today_ms, 10_000);
}

#[test]
fn test_absent_device_ticks_emit_nothing() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);
    sweep(&tracker, secs(60), &mut events);
    for s in 61..200 {
        sweep(&tracker, secs(s), &mut events);
    }
    assert_eq!(events.len(), 2);
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_sighting_before_tick_wins() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);

    // A sighting processed in the same cycle as the tick keeps the device present
    observe(&tracker, &sighting(secs(30)), &mut events);
    sweep(&tracker, secs(30), &mut events);

    assert_eq!(events.len(), 1);
    assert!(tracker.get(&events[0].fingerprint).unwrap().is_present());
}

#[test]
fn test_events_alternate_enter_leave() {
    let tracker = tracker(10);
    let mut events = Vec::new();

    // Mixed pattern of bursts, gaps and redundant ticks
    let script: &[(i64, bool)] = &[
        (0, true),
        (3, true),
        (5, false),
        (13, false),
        (14, false),
        (20, true),
        (21, true),
        (21, false),
        (25, true),
        (40, false),
        (41, false),
        (42, true),
        (43, true),
        (60, false),
        (61, true),
        (62, false),
        (100, false),
    ];
    for &(at, is_sighting) in script {
        if is_sighting {
            observe(&tracker, &sighting(secs(at)), &mut events);
        } else {
            sweep(&tracker, secs(at), &mut events);
        }
    }

    assert!(!events.is_empty());
    for (i, event) in events.iter().enumerate() {
        let expected = if i % 2 == 0 { TransitionKind::Enter } else { TransitionKind::Leave };
        assert_eq!(event.kind, expected, "event {} out of sequence: {:?}", i, events);
    }
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn test_address_rotation_keeps_identity() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);
    let mut rotated = sighting(secs(5));
    rotated.address = "5F:00:11:22:33:44".to_string();
    observe(&tracker, &rotated, &mut events);

    assert_eq!(events.len(), 1);
    assert_eq!(tracker.len(), 1);
    let record = tracker.get(&events[0].fingerprint).unwrap();
    assert_eq!(record.addresses.len(), 2);
}

#[test]
fn test_backwards_sighting_is_clamped() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(secs(20)), &mut events);

    let late = sighting(secs(5));
    let fp = FingerprintEngine::default().fingerprint(&late);
    let (step, _) = tracker.observe(&fp, classify(&late), &late, |_, _| ());
    assert!(step.clock_anomaly);
    assert_eq!(tracker.get(&fp.id).unwrap().last_seen, secs(20));

    // Re-entry after a backwards sighting never precedes the LEAVE
    sweep(&tracker, secs(50), &mut events);
    observe(&tracker, &sighting(secs(1)), &mut events);
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].kind, TransitionKind::Enter);
    assert!(events[2].timestamp >= events[1].timestamp);
}

#[test]
fn test_reenter_counters() {
    let tracker = tracker(10);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);
    sweep(&tracker, secs(10), &mut events);
    observe(&tracker, &sighting(secs(30)), &mut events);

    let record = tracker.get(&events[0].fingerprint).unwrap();
    assert_eq!(record.enter_count, 2);
    assert_eq!(record.leave_count, 1);
    assert_eq!(record.reenter_count, 1);
    assert_eq!(record.last_enter, Some(secs(30)));
}

#[test]
fn test_restored_present_device_is_closed_by_sweep() {
    let tracker = tracker(30);
    let obs = sighting(t0());
    let fp = FingerprintEngine::default().fingerprint(&obs);
    let mut record = DeviceRecord::new(&fp, classify(&obs), t0());
    record.state = PresenceState::Present;
    record.last_enter = Some(t0());
    record.enter_count = 1;
    tracker.restore(record);

    let mut events = Vec::new();
    sweep(&tracker, secs(45), &mut events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TransitionKind::Leave);
    assert_eq!(events[0].timestamp, t0());
}

#[test]
fn test_different_devices_are_independent() {
    let tracker = tracker(30);
    let mut events = Vec::new();
    observe(&tracker, &sighting(t0()), &mut events);
    let other = Observation::new("11:22:33:44:55:66", secs(1)).with_manufacturer(0x0075, &[]);
    observe(&tracker, &other, &mut events);

    assert_eq!(events.len(), 2);
    assert_ne!(events[0].fingerprint, events[1].fingerprint);

    sweep(&tracker, secs(30), &mut events);
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].fingerprint, events[0].fingerprint);
    assert_eq!(tracker.present_count(), 1);
}
