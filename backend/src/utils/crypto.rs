//! Keyed hashing helpers built on HMAC-SHA256.
//!
//! Refresh token secrets are stored under a server-side key so the raw value
//! never reaches the database while lookups stay deterministic.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub type HmacSha256 = Hmac<Sha256>;

/// Width in bytes of an HMAC-SHA256 tag.
pub const SIGNATURE_LEN: usize = 32;

/// Computes the HMAC-SHA256 tag of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    let mut tag = [0u8; SIGNATURE_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

/// Constant-time check of `tag` against the HMAC of `data` under `key`.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Hex-encoded keyed hash of a refresh token secret, as stored.
pub fn hash_refresh_token(pepper: &str, secret: &str) -> String {
    hex::encode(hmac_sha256(pepper.as_bytes(), secret.as_bytes()))
}
