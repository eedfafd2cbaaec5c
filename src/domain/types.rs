//! Shared types for BLE presence tracking

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Bluetooth base UUID suffix used to expand 16/32-bit UUIDs
const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Drop a leading `0x` or `0X`
pub fn strip_hex_prefix(raw: &str) -> &str {
    raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw)
}

/// Canonical form of a service UUID: lower-case, short forms expanded
/// to the Bluetooth base UUID.
pub fn canonical_uuid(raw: &str) -> String {
    let trimmed = strip_hex_prefix(raw.trim()).to_ascii_lowercase();
    let is_hex = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_hexdigit());
    match trimmed.len() {
        4 if is_hex => format!("0000{}{}", trimmed, BLUETOOTH_BASE_SUFFIX),
        8 if is_hex => format!("{}{}", trimmed, BLUETOOTH_BASE_SUFFIX),
        _ => trimmed,
    }
}

/// Scan record as delivered by the radio collaborator (one JSON line)
///
/// Every field is optional at this boundary; the normalizer decides what
/// is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawObservation {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, alias = "name")]
    pub local_name: Option<String>,
    #[serde(default)]
    pub rssi: Option<i64>,
    /// Manufacturer ID (decimal or 0x-hex) to hex payload
    #[serde(default)]
    pub manufacturer_data: HashMap<String, String>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
    /// Service UUID to hex payload
    #[serde(default)]
    pub service_data: HashMap<String, String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Normalized advertisement, ordered for hashing and comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: BTreeMap<u16, Bytes>,
    pub service_uuids: BTreeSet<String>,
    pub service_data: BTreeMap<String, Bytes>,
    pub observed_at: DateTime<Utc>,
    pub source: Option<String>,
}

impl Observation {
    pub fn new(address: &str, observed_at: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            local_name: None,
            rssi: None,
            manufacturer_data: BTreeMap::new(),
            service_uuids: BTreeSet::new(),
            service_data: BTreeMap::new(),
            observed_at,
            source: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_manufacturer(mut self, id: u16, payload: &[u8]) -> Self {
        self.manufacturer_data.insert(id, Bytes::copy_from_slice(payload));
        self
    }

    pub fn with_service_uuid(mut self, uuid: &str) -> Self {
        self.service_uuids.insert(canonical_uuid(uuid));
        self
    }

    pub fn with_service_data(mut self, uuid: &str, payload: &[u8]) -> Self {
        self.service_data.insert(canonical_uuid(uuid), Bytes::copy_from_slice(payload));
        self
    }

    /// True when the advertisement carries nothing a fingerprint can use
    pub fn is_silent(&self) -> bool {
        self.manufacturer_data.is_empty()
            && self.service_uuids.is_empty()
            && self.service_data.is_empty()
    }
}

/// Stable identity key derived from advertisement content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintId(pub String);

impl std::fmt::Display for FingerprintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FingerprintId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The sorted fields a fingerprint was computed from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintMaterial {
    pub manufacturer_ids: Vec<u16>,
    pub service_uuids: Vec<String>,
    pub service_data_keys: Vec<String>,
}

impl FingerprintMaterial {
    pub fn is_empty(&self) -> bool {
        self.manufacturer_ids.is_empty()
            && self.service_uuids.is_empty()
            && self.service_data_keys.is_empty()
    }
}

/// Result of fingerprinting one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub id: FingerprintId,
    pub version: &'static str,
    pub material: FingerprintMaterial,
}

impl Fingerprint {
    /// The anonymous bucket aliases every device that advertises no
    /// manufacturer or service data.
    pub fn is_anonymous(&self) -> bool {
        self.material.is_empty()
    }
}

/// Vendor and beacon labels (best effort)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub vendor: &'static str,
    pub beacon: &'static str,
}

impl Classification {
    pub const UNKNOWN: Classification = Classification { vendor: "unknown", beacon: "unknown" };

    pub fn has_vendor(&self) -> bool {
        self.vendor != Self::UNKNOWN.vendor
    }
}

/// Presence state per fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Absent,
    Present,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Absent => "absent",
            PresenceState::Present => "present",
        }
    }
}

/// Kind of presence transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    Enter,
    Leave,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "enter",
            TransitionKind::Leave => "leave",
        }
    }
}

/// Immutable presence transition, appended to history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub fingerprint: FingerprintId,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
    pub rssi: Option<i16>,
    /// When a LEAVE was detected; `timestamp` is the last sighting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

impl PresenceEvent {
    pub fn enter(fingerprint: FingerprintId, timestamp: DateTime<Utc>, rssi: Option<i16>) -> Self {
        Self { fingerprint, kind: TransitionKind::Enter, timestamp, rssi, detected_at: None }
    }

    pub fn leave(
        fingerprint: FingerprintId,
        timestamp: DateTime<Utc>,
        rssi: Option<i16>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint,
            kind: TransitionKind::Leave,
            timestamp,
            rssi,
            detected_at: Some(detected_at),
        }
    }
}
