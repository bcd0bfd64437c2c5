//! Batched, resumable copy of the source table into the target table.
//!
//! Batches cover disjoint key ranges `(after, through]` fixed before dispatch.
//! Workers read and derive concurrently; a single committer writes target
//! rows and then the cursor, strictly in range order. Target rows are
//! committed before the cursor, so a crash between the two replays that batch
//! on resume with identical upserts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::derive::DerivationError;
use crate::value::Value;

mod batch;
mod executor;
mod gate;

pub use batch::{
    delete_target_rows, derive_row, fetch_source_row, next_boundary, read_range, run_batch,
    target_row_exists, upsert_rows, BatchRange, DerivedBatch, TargetRow,
};
pub use executor::{BackfillExecutor, BackfillSummary};
pub use gate::MirrorGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPhase {
    Pending,
    Running,
    Exhausted,
}

impl BackfillPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BackfillPhase::Pending => "pending",
            BackfillPhase::Running => "running",
            BackfillPhase::Exhausted => "exhausted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(BackfillPhase::Pending),
            "running" => Some(BackfillPhase::Running),
            "exhausted" => Some(BackfillPhase::Exhausted),
            _ => None,
        }
    }
}

/// Progress checkpoint for one migration, persisted after every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillCursor {
    pub migration_id: Uuid,
    pub last_processed_key: Option<Value>,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub batches_committed: u64,
    pub phase: BackfillPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<i64>,
}

impl BackfillCursor {
    pub fn new(migration_id: Uuid) -> Self {
        Self {
            migration_id,
            last_processed_key: None,
            rows_processed: 0,
            rows_failed: 0,
            batches_committed: 0,
            phase: BackfillPhase::Pending,
            archived_at: None,
        }
    }

    /// True when `key` lies at or behind the committed cursor.
    pub fn covers(&self, key: &Value) -> bool {
        self.last_processed_key
            .as_ref()
            .is_some_and(|last| key.sql_cmp(last).is_le())
    }
}

/// A source row that could not be derived, held back from the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    pub key: Value,
    pub column: String,
    pub error: DerivationError,
}

/// Outcome of one committed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub sequence: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_quarantined: u64,
    pub last_key: Option<Value>,
}

/// Snapshot handed to a [`BatchObserver`] after each checkpoint.
#[derive(Debug, Clone)]
pub struct BatchStats {
    pub migration_id: Uuid,
    pub batch_index: u64,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub last_key: Option<Value>,
}

pub type BatchObserver = Arc<dyn Fn(&BatchStats) + Send + Sync>;

/// Cooperative cancellation: dispatch stops after the batch in flight.
#[derive(Clone, Default, Debug)]
pub struct BackfillControl {
    cancelled: Arc<AtomicBool>,
}

impl BackfillControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_covers_keys_up_to_last_processed() {
        let mut cursor = BackfillCursor::new(Uuid::now_v7());
        assert!(!cursor.covers(&Value::Integer(1)));
        cursor.last_processed_key = Some(Value::Integer(10));
        assert!(cursor.covers(&Value::Integer(10)));
        assert!(cursor.covers(&Value::Integer(3)));
        assert!(!cursor.covers(&Value::Integer(11)));
    }

    #[test]
    fn control_is_shared_between_clones() {
        let control = BackfillControl::new();
        let clone = control.clone();
        clone.cancel();
        assert!(control.is_cancelled());
        control.reset();
        assert!(!clone.is_cancelled());
    }
}
