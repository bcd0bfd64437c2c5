//! Row-keyed pseudo-random draws.
//!
//! A draw is `u = be_u64(SHA-256(canonical(row_key) || 0x1f || rule_id)[0..8]) / 2^64`,
//! uniformly distributed on `[0, 1)`. The same key and rule id always yield the
//! same `u`, so re-running or resuming a backfill reproduces every value.

use sha2::{Digest, Sha256};

use crate::value::Value;

const SEPARATOR: u8 = 0x1f;

pub fn seed_for(row_key: &Value, rule_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(row_key.canonical().as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(rule_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

pub fn unit_draw(row_key: &Value, rule_id: &str) -> f64 {
    // 53 high bits keep the result exactly representable and strictly below 1.
    (seed_for(row_key, rule_id) >> 11) as f64 / (1u64 << 53) as f64
}

/// Bernoulli(probability) draw for this row and rule.
pub fn bernoulli(row_key: &Value, rule_id: &str, probability: f64) -> bool {
    unit_draw(row_key, rule_id) < probability
}
