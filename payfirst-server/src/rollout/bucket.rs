//! Deterministic percentage bucketing.

use sha2::{Digest, Sha256};

/// Stable bucket in `0..100` for `key` under `flag`.
///
/// Independent of process, platform and restart: the same pair always lands
/// in the same bucket.
pub fn bucket(flag: &str, key: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(flag.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

pub fn in_rollout(flag: &str, key: &str, percentage: u8) -> bool {
    match percentage {
        0 => false,
        p if p >= 100 => true,
        p => bucket(flag, key) < p,
    }
}
