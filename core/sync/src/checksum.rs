//! Payload integrity digests.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use ledgersync_common::{Error, Result};

use crate::model::{EntityPayload, OfflineChange};

type Blake2b256 = Blake2b<U32>;

/// Compute the checksum of a payload.
///
/// The digest covers the canonical JSON form of the payload (struct fields
/// serialize in declaration order), so it depends on nothing but `data`.
///
/// # Errors
/// - Serialization failure; the caller must treat the change as not queued
pub fn compute(data: &EntityPayload) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Blake2b256::digest(&bytes)))
}

/// Check a change's payload against its recorded checksum.
///
/// # Errors
/// - `Error::Integrity` on mismatch
pub fn verify(change: &OfflineChange) -> Result<()> {
    if compute(&change.data)? == change.checksum {
        Ok(())
    } else {
        Err(Error::Integrity {
            change_id: change.id.to_string(),
        })
    }
}
