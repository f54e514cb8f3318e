//! Challenge-response password gate.
//!
//! The uploader issues a one-time random challenge; the downloader answers with
//! HMAC-SHA256 over the challenge, keyed by the password. The password itself never
//! crosses the channel and a captured response is useless once the challenge
//! is replaced.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes per challenge (64 hex characters on the wire).
pub const CHALLENGE_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("password cannot be used as a MAC key")]
    Key,
}

/// Generate a fresh challenge from the OS RNG, hex encoded.
pub fn issue_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Deterministic response for `(password, challenge)`; both peers compute it the same way.
pub fn compute_response(password: &str, challenge: &str) -> Result<String, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(password.as_bytes()).map_err(|_| AuthError::Key)?;
    mac.update(challenge.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a submitted response against the one expected for `challenge`.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn verify_response(password: &str, challenge: &str, response: &str) -> bool {
    match compute_response(password, challenge) {
        Ok(expected) => constant_time_eq(expected.as_bytes(), response.as_bytes()),
        Err(_) => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
