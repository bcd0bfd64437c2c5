//! Online schema migration for SQLite tables: derive a new table from a live
//! one in resumable batches, verify it, enforce its constraints, then flip
//! readers over with a single router swap.

pub mod backfill;
pub mod config;
pub mod constraints;
pub mod db;
pub mod derive;
mod error;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod router;
pub mod schema;
pub mod state;
pub mod store;
pub mod time;
pub mod value;
pub mod verify;

pub use error::{codes, AppError, AppResult};
pub use orchestrator::{MigrationStatus, MirrorOutcome, Orchestrator, RetrySummary};
pub use plan::MigrationPlan;
pub use router::ActiveTableRouter;
pub use state::MigrationState;
pub use value::Value;
pub use verify::VerificationReport;
