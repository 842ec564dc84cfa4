//! Core types shared across the node

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hash type: 256-bit SHA-256 digest
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// The all-zero hash, used as the genesis parent pointer.
pub const ZERO_HASH: Hash = [0u8; 32];

/// SHA-256 of an arbitrary byte string.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

/// Current wall-clock time as seconds since the Unix epoch.
///
/// Timestamps only disambiguate otherwise-identical transactions and stamp
/// block headers; a clock before the epoch is treated as the epoch.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
