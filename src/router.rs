//! Active-table indirection consumed by readers.
//!
//! Every read path asks the router which physical table currently backs a
//! logical name. Activation and rollback replace the designation with one
//! compare-and-swap under the write lock, so a reader observes either the old
//! designation or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::info;

use crate::error::codes;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Designation {
    pub table: Arc<str>,
    /// Bumped on every swap.
    pub generation: u64,
}

#[derive(Debug)]
pub struct ActiveTableRouter {
    logical_name: String,
    current: RwLock<Arc<Designation>>,
}

impl ActiveTableRouter {
    pub fn new(logical_name: impl Into<String>, table: &str, generation: u64) -> Self {
        Self {
            logical_name: logical_name.into(),
            current: RwLock::new(Arc::new(Designation {
                table: Arc::from(table),
                generation,
            })),
        }
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn current_table(&self) -> Arc<str> {
        self.designation().table.clone()
    }

    pub fn designation(&self) -> Arc<Designation> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Point the router at `to` if it currently designates `expected`.
    pub fn compare_and_swap(&self, expected: &str, to: &str) -> AppResult<Arc<Designation>> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if &*guard.table != expected {
            return Err(AppError::new(
                codes::ROUTER_CAS_CONFLICT,
                "Active table changed underneath the swap.",
            )
            .with_context("logical_name", self.logical_name.clone())
            .with_context("expected", expected)
            .with_context("found", guard.table.to_string()));
        }
        let next = Arc::new(Designation {
            table: Arc::from(to),
            generation: guard.generation + 1,
        });
        *guard = next.clone();
        info!(
            target: "tableshift",
            event = "router_swapped",
            logical_name = %self.logical_name,
            from = %expected,
            to = %to,
            generation = next.generation
        );
        Ok(next)
    }

    /// Adopt a designation persisted by another process when it is newer
    /// than ours. Returns whether the router moved.
    pub fn advance_to(&self, table: &str, generation: u64) -> bool {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        if generation <= guard.generation {
            return false;
        }
        *guard = Arc::new(Designation {
            table: Arc::from(table),
            generation,
        });
        info!(
            target: "tableshift",
            event = "router_synced",
            logical_name = %self.logical_name,
            table = %table,
            generation
        );
        true
    }
}

/// One router per logical name, shared by every component of a process.
#[derive(Debug, Default, Clone)]
pub struct RouterRegistry {
    routers: Arc<Mutex<HashMap<String, Arc<ActiveTableRouter>>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, logical_name: &str) -> Option<Arc<ActiveTableRouter>> {
        let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers.get(logical_name).cloned()
    }

    /// Return the existing router or install one built from the given
    /// designation.
    pub fn get_or_insert(
        &self,
        logical_name: &str,
        table: &str,
        generation: u64,
    ) -> Arc<ActiveTableRouter> {
        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers
            .entry(logical_name.to_string())
            .or_insert_with(|| Arc::new(ActiveTableRouter::new(logical_name, table, generation)))
            .clone()
    }
}
