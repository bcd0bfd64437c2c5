use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::codes;
use crate::{AppError, AppResult};

/// Lifecycle of one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Planned,
    Backfilling,
    Validating,
    ConstraintsApplied,
    Verified,
    Active,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: MigrationState,
    pub to: MigrationState,
}

impl From<TransitionError> for AppError {
    fn from(error: TransitionError) -> Self {
        AppError::new(codes::ILLEGAL_TRANSITION, error.to_string())
            .with_context("from", error.from.as_str())
            .with_context("to", error.to.as_str())
    }
}

impl MigrationState {
    pub const ALL: [MigrationState; 8] = [
        MigrationState::Planned,
        MigrationState::Backfilling,
        MigrationState::Validating,
        MigrationState::ConstraintsApplied,
        MigrationState::Verified,
        MigrationState::Active,
        MigrationState::RolledBack,
        MigrationState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Planned => "planned",
            MigrationState::Backfilling => "backfilling",
            MigrationState::Validating => "validating",
            MigrationState::ConstraintsApplied => "constraints_applied",
            MigrationState::Verified => "verified",
            MigrationState::Active => "active",
            MigrationState::RolledBack => "rolled_back",
            MigrationState::Failed => "failed",
        }
    }

    /// `Active` and `Failed` still accept a rollback; only `RolledBack` is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MigrationState::Active | MigrationState::RolledBack | MigrationState::Failed
        )
    }

    /// States in which the (source, target) pair is still claimed.
    pub fn holds_table_pair(self) -> bool {
        !matches!(self, MigrationState::Active | MigrationState::RolledBack)
    }

    pub fn next(self) -> Option<MigrationState> {
        match self {
            MigrationState::Planned => Some(MigrationState::Backfilling),
            MigrationState::Backfilling => Some(MigrationState::Validating),
            MigrationState::Validating => Some(MigrationState::ConstraintsApplied),
            MigrationState::ConstraintsApplied => Some(MigrationState::Verified),
            MigrationState::Verified => Some(MigrationState::Active),
            _ => None,
        }
    }

    pub fn can_transition_to(self, to: MigrationState) -> bool {
        match to {
            MigrationState::Failed => !self.is_terminal(),
            MigrationState::RolledBack => {
                matches!(self, MigrationState::Failed | MigrationState::Active)
            }
            _ => self.next() == Some(to),
        }
    }

    pub fn transition(self, to: MigrationState) -> Result<MigrationState, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        MigrationState::ALL
            .into_iter()
            .find(|state| state.as_str() == raw)
            .ok_or_else(|| {
                AppError::new(codes::ILLEGAL_TRANSITION, format!("unknown migration state {raw:?}"))
            })
    }
}

/// In-process registry of migrations currently being driven.
#[derive(Default, Clone)]
pub struct RunRegistry {
    flags: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, id: Uuid) -> AppResult<RunGuard> {
        let flag = {
            let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
            flags
                .entry(id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .clone()
        };
        RunGuard::begin(flag, id)
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        flags
            .get(&id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Held while one task drives a migration; released on drop.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn begin(flag: Arc<AtomicBool>, id: Uuid) -> AppResult<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::new(
                codes::ALREADY_RUNNING,
                "Migration is already being driven by another task.",
            )
            .with_context("migration_id", id.to_string()));
        }
        Ok(Self { flag })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
