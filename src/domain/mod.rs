//! Domain models - core presence types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Observation` - a normalized BLE advertisement
//! - `Fingerprint` - stable identity derived from advertisement content
//! - `PresenceEvent` - ENTER/LEAVE transitions
//! - `DeviceRecord` - long-lived per-device presence state
//! - `DailyAggregate` - per-day dwell totals

pub mod device;
pub mod types;

pub use device::{split_by_day, DailyAggregate, DeviceRecord};
pub use types::{
    Classification, Fingerprint, FingerprintId, FingerprintMaterial, Observation, PresenceEvent,
    PresenceState, RawObservation, TransitionKind,
};
