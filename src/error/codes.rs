//! Error codes shared by the engine. Fatal codes move a migration to
//! `Failed`; blocking codes leave it in its current phase.

pub const DERIVATION: &str = "MIGRATION/DERIVATION";
pub const CONSTRAINT_VIOLATION: &str = "MIGRATION/CONSTRAINT_VIOLATION";
pub const BATCH_TIMEOUT: &str = "MIGRATION/BATCH_TIMEOUT";
pub const INTEGRITY_MISMATCH: &str = "MIGRATION/INTEGRITY_MISMATCH";
pub const EXHAUSTED_RETRIES: &str = "MIGRATION/EXHAUSTED_RETRIES";
pub const FAILURE_THRESHOLD: &str = "MIGRATION/FAILURE_THRESHOLD";
pub const NOT_FOUND: &str = "MIGRATION/NOT_FOUND";
pub const ALREADY_RUNNING: &str = "MIGRATION/ALREADY_RUNNING";
pub const CANCELLED: &str = "MIGRATION/CANCELLED";
pub const WORKER_FAILED: &str = "MIGRATION/WORKER_FAILED";
pub const CURSOR_CONFLICT: &str = "MIGRATION/CURSOR_CONFLICT";

pub const PLAN_INVALID: &str = "PLAN/INVALID";
pub const SCHEMA_MISMATCH: &str = "SCHEMA/MISMATCH";
pub const SCHEMA_MISSING_TABLE: &str = "SCHEMA/MISSING_TABLE";
pub const ILLEGAL_TRANSITION: &str = "STATE/ILLEGAL_TRANSITION";
pub const ROUTER_CAS_CONFLICT: &str = "ROUTER/CAS_CONFLICT";
pub const CONFIG_INVALID: &str = "CONFIG/INVALID";

pub fn is_fatal(code: &str) -> bool {
    matches!(code, EXHAUSTED_RETRIES | FAILURE_THRESHOLD | SCHEMA_MISMATCH)
}

pub fn is_blocking(code: &str) -> bool {
    matches!(code, CONSTRAINT_VIOLATION | INTEGRITY_MISMATCH)
}
