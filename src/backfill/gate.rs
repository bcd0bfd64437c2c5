use std::collections::HashMap;

use tokio::sync::{Mutex, MutexGuard};

use super::BatchRange;
use crate::value::Value;

/// Serializes batch commits against mirrored writes within one process.
///
/// A mirrored write for a key the cursor has not reached yet is parked here;
/// the committer re-reads parked keys that fall in its range while holding
/// the lock, so a batch read before the write cannot overwrite it.
#[derive(Debug, Default)]
pub struct MirrorGate {
    pending: Mutex<PendingKeys>,
}

#[derive(Debug, Default)]
pub struct PendingKeys {
    keys: HashMap<String, Value>,
}

impl PendingKeys {
    pub fn defer(&mut self, key: Value) {
        self.keys.insert(key.canonical(), key);
    }

    /// Remove and return parked keys inside `range`, in key order.
    pub fn take_in_range(&mut self, range: &BatchRange) -> Vec<Value> {
        let mut taken: Vec<Value> = Vec::new();
        self.keys.retain(|_, key| {
            if range.contains(key) {
                taken.push(key.clone());
                false
            } else {
                true
            }
        });
        taken.sort_by(|a, b| a.sql_cmp(b));
        taken
    }

    /// Remove and return every parked key, in key order.
    pub fn take_all(&mut self) -> Vec<Value> {
        let mut taken: Vec<Value> = self.keys.drain().map(|(_, key)| key).collect();
        taken.sort_by(|a, b| a.sql_cmp(b));
        taken
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl MirrorGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, PendingKeys> {
        self.pending.lock().await
    }
}
