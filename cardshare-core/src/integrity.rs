//! Integrity: SHA-256 digests of whole files, logged on both ends for comparison.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Hex-encoded SHA-256 of a payload.
pub fn digest_hex(payload: &[u8]) -> String {
    hex::encode(digest(payload))
}
