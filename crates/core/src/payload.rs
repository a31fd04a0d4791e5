//! Wire payload: the JSON artifact an encryption run produces and a
//! decryption run consumes.
//!
//! Binary fields travel as URL-safe base64 without padding. The `check`
//! field is a short checksum over the canonical (sorted-key, compact) JSON
//! with `check` itself blanked, so it survives any re-formatting of the
//! transport JSON but catches field edits.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::params::SALT_LEN;

pub const PAYLOAD_VERSION: &str = "1.0.0";

/// Truncated checksum length in bytes; this is a framing check, not the
/// authentication boundary (the AEAD tag is).
const CHECK_LEN: usize = 4;

mod b64 {
    use super::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        URL_SAFE_NO_PAD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// One backend's worth of lanes: all lanes in a record share a salt and a
/// per-lane step count, and their masked seeds are stored concatenated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneRecord {
    /// Human-readable backend label; not interpreted on replay.
    pub name: String,
    #[serde(rename = "iter")]
    pub step_count: u64,
    #[serde(rename = "seedNum")]
    pub seed_count: u32,
    #[serde(rename = "seedLen")]
    pub seed_len: u32,
    /// Masked seeds, `seed_len` bytes each, in lane order.
    #[serde(with = "b64")]
    pub seeds: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
}

impl LaneRecord {
    /// Structural validation. Violations are rejected, never silently fixed.
    pub fn validate(&self) -> Result<()> {
        if self.step_count == 0 {
            return Err(Error::Validation("lane step count must be >= 1".into()));
        }
        if self.seed_count == 0 {
            return Err(Error::Validation("lane seed count must be >= 1".into()));
        }
        if !(1..=32).contains(&self.seed_len) {
            return Err(Error::Validation("seed length must be in 1..=32".into()));
        }
        if self.seeds.len() != self.seed_len as usize * self.seed_count as usize {
            return Err(Error::Validation(
                "seeds length does not match seed count x seed length".into(),
            ));
        }
        if self.salt.len() != SALT_LEN {
            return Err(Error::Validation(format!(
                "salt must be {SALT_LEN} bytes"
            )));
        }
        // The record's step total must fit in a u64; these counts come off
        // the wire and are not trusted.
        if self.step_count.checked_mul(self.seed_count as u64).is_none() {
            return Err(Error::Validation(
                "lane step count x seed count overflows".into(),
            ));
        }
        Ok(())
    }

    /// Masked seed of lane `index` within this record.
    pub fn seed(&self, index: u32) -> &[u8] {
        let len = self.seed_len as usize;
        &self.seeds[index as usize * len..][..len]
    }

    /// Total chain steps this record represents across its lanes. Saturates
    /// rather than wrapping on unvalidated records.
    pub fn total_steps(&self) -> u64 {
        self.step_count.saturating_mul(self.seed_count as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub version: String,
    pub cost: f64,
    #[serde(with = "b64")]
    pub cipher: Vec<u8>,
    /// Lane records in replay order: GPU lanes first, then CPU lanes.
    #[serde(rename = "nodes")]
    pub lanes: Vec<LaneRecord>,
    pub check: String,
}

impl SealedPayload {
    pub fn new(cost: f64, cipher: Vec<u8>, lanes: Vec<LaneRecord>) -> Result<Self> {
        let mut payload = Self {
            version: PAYLOAD_VERSION.into(),
            cost,
            cipher,
            lanes,
            check: String::new(),
        };
        payload.check = payload.compute_check()?;
        Ok(payload)
    }

    /// Checksum over the canonical JSON with `check` blanked. serde_json maps
    /// sort keys, which gives us the canonical ordering for free.
    fn compute_check(&self) -> Result<String> {
        let mut blanked = self.clone();
        blanked.check = String::new();
        let canonical = serde_json::to_string(
            &serde_json::to_value(&blanked).map_err(|e| Error::Malformed(e.to_string()))?,
        )
        .map_err(|e| Error::Malformed(e.to_string()))?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(&digest[..CHECK_LEN]))
    }

    pub fn verify_check(&self) -> Result<()> {
        if self.compute_check()? != self.check {
            return Err(Error::Integrity);
        }
        Ok(())
    }

    /// Structural validation of every record, before any chain work.
    pub fn validate(&self) -> Result<()> {
        if self.lanes.is_empty() {
            return Err(Error::Validation("payload has no lane records".into()));
        }
        if self.cipher.is_empty() {
            return Err(Error::Validation("payload has no ciphertext".into()));
        }
        for lane in &self.lanes {
            lane.validate()?;
        }
        Ok(())
    }

    pub fn total_steps(&self) -> u64 {
        self.lanes
            .iter()
            .map(LaneRecord::total_steps)
            .fold(0, u64::saturating_add)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Malformed(e.to_string()))
    }

    /// Parse, verify the checksum, and validate structure.
    pub fn from_json(text: &str) -> Result<Self> {
        let payload: Self =
            serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))?;
        payload.verify_check()?;
        payload.validate()?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SealedPayload {
        SealedPayload::new(
            1.5,
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            vec![LaneRecord {
                name: "CPU".into(),
                step_count: 1000,
                seed_count: 2,
                seed_len: 4,
                seeds: vec![1, 2, 3, 4, 5, 6, 7, 8],
                salt: vec![9u8; SALT_LEN],
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_json_round_trip() {
        let payload = sample();
        let decoded = SealedPayload::from_json(&payload.to_json().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_check_survives_reformatting() {
        let payload = sample();
        // Compact vs pretty framing must not affect the checksum.
        let compact = serde_json::to_string(&payload).unwrap();
        assert!(SealedPayload::from_json(&compact).is_ok());
    }

    #[test]
    fn test_field_edit_breaks_check() {
        let payload = sample();
        let mut value: serde_json::Value =
            serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        value["cost"] = serde_json::json!(0.1);
        let edited = serde_json::to_string(&value).unwrap();
        assert!(matches!(
            SealedPayload::from_json(&edited),
            Err(Error::Integrity)
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            SealedPayload::from_json("{not json"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_seed_length_mismatch_rejected() {
        let record = LaneRecord {
            name: "CPU".into(),
            step_count: 10,
            seed_count: 3,
            seed_len: 4,
            seeds: vec![0u8; 8], // should be 12
            salt: vec![0u8; SALT_LEN],
        };
        assert!(matches!(record.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_seed_len_bounds() {
        let mut record = LaneRecord {
            name: "CPU".into(),
            step_count: 10,
            seed_count: 1,
            seed_len: 0,
            seeds: vec![],
            salt: vec![0u8; SALT_LEN],
        };
        assert!(record.validate().is_err());
        record.seed_len = 33;
        record.seeds = vec![0u8; 33];
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_oversized_step_total_rejected() {
        // Wire counts whose product would wrap a u64 must fail validation,
        // and the step-total accessors must not overflow on the raw record.
        let record = LaneRecord {
            name: "CPU".into(),
            step_count: u64::MAX / 2,
            seed_count: 3,
            seed_len: 4,
            seeds: vec![0u8; 12],
            salt: vec![0u8; SALT_LEN],
        };
        assert!(matches!(record.validate(), Err(Error::Validation(_))));
        assert_eq!(record.total_steps(), u64::MAX);

        let payload = SealedPayload::new(1.0, vec![1], vec![record.clone(), record]).unwrap();
        assert_eq!(payload.total_steps(), u64::MAX);
        assert!(matches!(payload.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_seed_slicing() {
        let record = LaneRecord {
            name: "CPU".into(),
            step_count: 1,
            seed_count: 2,
            seed_len: 3,
            seeds: vec![1, 2, 3, 4, 5, 6],
            salt: vec![0u8; SALT_LEN],
        };
        assert_eq!(record.seed(0), &[1, 2, 3]);
        assert_eq!(record.seed(1), &[4, 5, 6]);
    }
}
