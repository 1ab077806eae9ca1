//! Content-derived identity for digested artifacts.
//!
//! The rollout version of an artifact is the blake3 hash of its canonical JSON
//! with the rollout fields blanked, truncated to 16 hex chars. The content
//! checksum is the full hex of the same hash. Every composed component
//! version and every resolved value is part of the hashed bytes, so two
//! compositions of identical inputs produce identical rollout versions.

use crate::types::{Checksum, RolloutVersion};
use serde::Serialize;

/// Length of a rendered rollout version.
pub const ROLLOUT_VERSION_LEN: usize = 16;

/// An artifact carrying its own rollout identity fields.
pub trait RolloutIdentity: Serialize {
    fn rollout_version_mut(&mut self) -> &mut RolloutVersion;

    fn content_checksum_mut(&mut self) -> Option<&mut Checksum> {
        None
    }
}

/// Canonical byte form used for hashing: compact JSON in declaration order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Blank the rollout fields, hash the canonical form, and fill them in.
pub fn seal<T: RolloutIdentity>(artifact: &mut T) -> Result<RolloutVersion, serde_json::Error> {
    *artifact.rollout_version_mut() = RolloutVersion::default();
    if let Some(checksum) = artifact.content_checksum_mut() {
        *checksum = Checksum::default();
    }

    let hex = blake3::hash(&canonical_json(artifact)?).to_hex().to_string();
    let rollout = RolloutVersion::new(&hex[..ROLLOUT_VERSION_LEN]);

    *artifact.rollout_version_mut() = rollout.clone();
    if let Some(checksum) = artifact.content_checksum_mut() {
        *checksum = Checksum::new(hex);
    }
    Ok(rollout)
}

/// Recompute the seal of a stored artifact and compare it with what it carries.
pub fn verify_seal<T: RolloutIdentity + Clone>(artifact: &T) -> Result<bool, serde_json::Error> {
    let mut stored = artifact.clone();
    let mut resealed = artifact.clone();
    seal(&mut resealed)?;

    let same_rollout = *stored.rollout_version_mut() == *resealed.rollout_version_mut();
    let same_checksum = match (stored.content_checksum_mut(), resealed.content_checksum_mut()) {
        (Some(a), Some(b)) => *a == *b,
        _ => true,
    };
    Ok(same_rollout && same_checksum)
}

/// Full blake3 hex digest of raw bytes.
pub fn checksum_bytes(bytes: &[u8]) -> Checksum {
    Checksum::new(blake3::hash(bytes).to_hex().to_string())
}
