//! Vendor and beacon classification
//!
//! Two ordered rule tables, evaluated first-match-wins. Labels are a
//! best-effort hint for humans and notification filters; nothing in the
//! presence logic depends on them.

use crate::domain::types::{canonical_uuid, Classification, Observation};

/// What a rule looks at
#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// Manufacturer ID present
    Manufacturer(u16),
    /// Manufacturer ID present and its payload starts with the prefix
    ManufacturerPrefix(u16, &'static [u8]),
    /// Any manufacturer payload starting with the prefix
    AnyManufacturerPrefix(&'static [u8]),
    /// 16-bit service UUID advertised, either in the UUID list or as service data
    Service(&'static str),
}

impl Matcher {
    fn matches(&self, observation: &Observation) -> bool {
        match *self {
            Matcher::Manufacturer(id) => observation.manufacturer_data.contains_key(&id),
            Matcher::ManufacturerPrefix(id, prefix) => observation
                .manufacturer_data
                .get(&id)
                .is_some_and(|payload| payload.starts_with(prefix)),
            Matcher::AnyManufacturerPrefix(prefix) => {
                observation.manufacturer_data.values().any(|payload| payload.starts_with(prefix))
            }
            Matcher::Service(short) => {
                let uuid = canonical_uuid(short);
                observation.service_uuids.contains(&uuid)
                    || observation.service_data.contains_key(&uuid)
            }
        }
    }
}

struct Rule {
    matcher: Matcher,
    label: &'static str,
}

const fn rule(matcher: Matcher, label: &'static str) -> Rule {
    Rule { matcher, label }
}

/// Vendor rules (Bluetooth SIG company identifiers, member service UUIDs)
const VENDOR_RULES: &[Rule] = &[
    rule(Matcher::Manufacturer(0x004C), "apple"),
    rule(Matcher::Manufacturer(0x0006), "microsoft"),
    rule(Matcher::Manufacturer(0x0075), "samsung"),
    rule(Matcher::Manufacturer(0x00E0), "google"),
    rule(Matcher::Manufacturer(0x0059), "nordic"),
    rule(Matcher::Manufacturer(0x0087), "garmin"),
    rule(Matcher::Manufacturer(0x0157), "huami"),
    rule(Matcher::Manufacturer(0x038F), "xiaomi"),
    rule(Matcher::Service("FEED"), "tile"),
    rule(Matcher::Service("FEEC"), "tile"),
    rule(Matcher::Service("FE9F"), "google"),
    rule(Matcher::Service("FE95"), "xiaomi"),
];

/// Beacon protocol rules; more specific payload rules come first
const BEACON_RULES: &[Rule] = &[
    rule(Matcher::ManufacturerPrefix(0x004C, &[0x02, 0x15]), "ibeacon"),
    rule(Matcher::ManufacturerPrefix(0x004C, &[0x12]), "findmy"),
    rule(Matcher::AnyManufacturerPrefix(&[0xBE, 0xAC]), "altbeacon"),
    rule(Matcher::Service("FEAA"), "eddystone"),
    rule(Matcher::Service("FD6F"), "exposure_notification"),
    rule(Matcher::Service("FEED"), "tile"),
];

fn first_match(rules: &[Rule], observation: &Observation) -> Option<&'static str> {
    rules.iter().find(|r| r.matcher.matches(observation)).map(|r| r.label)
}

/// Classify an observation; total, never fails
pub fn classify(observation: &Observation) -> Classification {
    Classification {
        vendor: first_match(VENDOR_RULES, observation).unwrap_or(Classification::UNKNOWN.vendor),
        beacon: first_match(BEACON_RULES, observation).unwrap_or(Classification::UNKNOWN.beacon),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn obs() -> Observation {
        Observation::new("AA:BB:CC:DD:EE:FF", Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap())
    }

    #[test]
    fn test_unknown_when_nothing_matches() {
        assert_eq!(classify(&obs()), Classification::UNKNOWN);
        let other = obs().with_manufacturer(0x1234, &[0x00]);
        assert_eq!(classify(&other), Classification::UNKNOWN);
    }

    #[test]
    fn test_ibeacon() {
        let o = obs().with_manufacturer(0x004C, &[0x02, 0x15, 0xAA]);
        let c = classify(&o);
        assert_eq!(c.vendor, "apple");
        assert_eq!(c.beacon, "ibeacon");
    }

    #[test]
    fn test_apple_without_beacon() {
        let o = obs().with_manufacturer(0x004C, &[0x10, 0x05]);
        let c = classify(&o);
        assert_eq!(c.vendor, "apple");
        assert_eq!(c.beacon, "unknown");
    }

    #[test]
    fn test_eddystone_via_service_data() {
        let o = obs().with_service_data("FEAA", &[0x10]);
        assert_eq!(classify(&o).beacon, "eddystone");
        assert_eq!(classify(&o).vendor, "unknown");
    }

    #[test]
    fn test_altbeacon_any_manufacturer() {
        let o = obs().with_manufacturer(0x0118, &[0xBE, 0xAC, 0x01]);
        assert_eq!(classify(&o).beacon, "altbeacon");
    }

    #[test]
    fn test_first_vendor_rule_wins() {
        let o = obs().with_manufacturer(0x0075, &[]).with_manufacturer(0x004C, &[]);
        assert_eq!(classify(&o).vendor, "apple");
    }

    #[test]
    fn test_tile_service_uuid() {
        let o = obs().with_service_uuid("feed");
        let c = classify(&o);
        assert_eq!(c.vendor, "tile");
        assert_eq!(c.beacon, "tile");
    }
}
