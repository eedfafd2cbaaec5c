//! Advertisement normalizer
//!
//! Turns scan records into canonical `Observation`s. Records without an
//! address are dropped here and never reach the presence state machine.
//! Individual malformed fields (bad manufacturer ID, bad hex payload) are
//! dropped or emptied without rejecting the whole record.

use crate::domain::types::{canonical_uuid, strip_hex_prefix, Observation, RawObservation};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Parse a manufacturer ID given as decimal ("76") or hex ("0x004C")
fn parse_manufacturer_id(key: &str) -> Option<u16> {
    let key = key.trim();
    let digits = strip_hex_prefix(key);
    if digits.len() < key.len() {
        u16::from_str_radix(digits, 16).ok()
    } else {
        key.parse::<u16>().ok()
    }
}

/// Decode a hex payload, tolerating `0x` prefixes and `:`/space separators
fn decode_payload(raw: &str) -> Bytes {
    let cleaned: String = strip_hex_prefix(raw.trim())
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .collect();
    match hex::decode(&cleaned) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            debug!(error = %e, "payload_not_hex");
            Bytes::new()
        }
    }
}

/// Normalize one scan record. Returns `None` when the record is unusable.
pub fn normalize(raw: RawObservation, received_at: DateTime<Utc>) -> Option<Observation> {
    let address = raw.address.as_deref().map(str::trim).filter(|a| !a.is_empty())?;

    let mut manufacturer_data = BTreeMap::new();
    for (key, payload) in &raw.manufacturer_data {
        match parse_manufacturer_id(key) {
            Some(id) => {
                manufacturer_data.insert(id, decode_payload(payload));
            }
            None => debug!(key = %key, "manufacturer_id_invalid"),
        }
    }

    let service_uuids: BTreeSet<String> = raw
        .service_uuids
        .iter()
        .map(|u| canonical_uuid(u))
        .filter(|u| !u.is_empty())
        .collect();

    let service_data: BTreeMap<String, Bytes> = raw
        .service_data
        .iter()
        .map(|(uuid, payload)| (canonical_uuid(uuid), decode_payload(payload)))
        .filter(|(uuid, _)| !uuid.is_empty())
        .collect();

    let local_name =
        raw.local_name.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);

    Some(Observation {
        address: address.to_ascii_uppercase(),
        local_name,
        rssi: raw.rssi.and_then(|r| i16::try_from(r).ok()),
        manufacturer_data,
        service_uuids,
        service_data,
        observed_at: raw.observed_at.unwrap_or(received_at),
        source: raw.source,
    })
}

/// Parse and normalize one JSON line from the scan source
pub fn parse_line(line: &str, received_at: DateTime<Utc>) -> Option<Observation> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<RawObservation>(line) {
        Ok(raw) => normalize(raw, received_at),
        Err(e) => {
            debug!(error = %e, "observation_parse_failed");
            None
        }
    }
}
