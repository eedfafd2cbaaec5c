//! Fingerprint engine
//!
//! Derives a stable identity from the parts of an advertisement that do not
//! rotate: manufacturer IDs, service UUIDs and service-data keys. Address and
//! RSSI never contribute, so identity survives address randomization.
//!
//! Canonical material (sets sorted, IDs in decimal):
//!
//! ```text
//! mfg=76,224|svc=0000180f-...|sdk=0000feaa-...
//! ```
//!
//! The digest is SHA-256 over the material, truncated per version. Changing
//! the truncation or the material layout requires a new version tag so that
//! existing histories keep their identities.

use crate::domain::types::{Fingerprint, FingerprintId, FingerprintMaterial, Observation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Versioned fingerprint hash function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintVersion {
    /// SHA-256, 6 bytes (12 hex chars)
    #[default]
    V1,
    /// SHA-256, 16 bytes (32 hex chars)
    V2,
}

impl FingerprintVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintVersion::V1 => "v1",
            FingerprintVersion::V2 => "v2",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            FingerprintVersion::V1 => 6,
            FingerprintVersion::V2 => 16,
        }
    }
}

/// Stateless fingerprint calculator for one hash version
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintEngine {
    version: FingerprintVersion,
}

impl FingerprintEngine {
    pub fn new(version: FingerprintVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> FingerprintVersion {
        self.version
    }

    /// Compute the fingerprint of an observation
    pub fn fingerprint(&self, observation: &Observation) -> Fingerprint {
        // BTree collections are already sorted and deduplicated
        let material = FingerprintMaterial {
            manufacturer_ids: observation.manufacturer_data.keys().copied().collect(),
            service_uuids: observation.service_uuids.iter().cloned().collect(),
            service_data_keys: observation.service_data.keys().cloned().collect(),
        };
        self.from_material(material)
    }

    /// Compute the fingerprint of already-collected material.
    /// The material is canonicalized (sorted, deduplicated) first.
    pub fn from_material(&self, mut material: FingerprintMaterial) -> Fingerprint {
        material.manufacturer_ids.sort_unstable();
        material.manufacturer_ids.dedup();
        material.service_uuids.sort();
        material.service_uuids.dedup();
        material.service_data_keys.sort();
        material.service_data_keys.dedup();

        let canonical = canonical_bytes(&material);
        let digest = Sha256::digest(&canonical);
        let id = hex::encode(&digest[..self.version.digest_len()]);

        Fingerprint { id: FingerprintId(id), version: self.version.as_str(), material }
    }

    /// Identity of the anonymous bucket for this version
    pub fn anonymous(&self) -> FingerprintId {
        self.from_material(FingerprintMaterial::default()).id
    }
}

fn canonical_bytes(material: &FingerprintMaterial) -> Vec<u8> {
    let mfg: Vec<String> = material.manufacturer_ids.iter().map(|id| id.to_string()).collect();
    format!(
        "mfg={}|svc={}|sdk={}",
        mfg.join(","),
        material.service_uuids.join(","),
        material.service_data_keys.join(",")
    )
    .into_bytes()
}
