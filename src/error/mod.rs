use std::collections::HashMap;
use std::fmt;
use std::io::Error as IoError;

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;

pub mod codes;

/// A structured error that can be serialized, persisted with a migration and
/// surfaced to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Migration id, state, phase and failing keys or counts.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// The error stops the migration for good and moves it to `Failed`.
    pub fn is_fatal(&self) -> bool {
        codes::is_fatal(&self.code)
    }

    /// The migration stays in its phase until an operator fixes the data.
    pub fn is_blocking(&self) -> bool {
        codes::is_blocking(&self.code)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, " ({pairs:?})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        AppError::new(format!("IO/{:?}", error.kind()), error.to_string())
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_syntax() || error.is_eof() {
            "JSON/SYNTAX"
        } else {
            "JSON/DATA"
        };
        AppError::new(code, error.to_string()).with_context("line", error.line().to_string())
    }
}

/// Database errors keep SQLite's extended result code (`Sqlite/5` is BUSY,
/// `Sqlite/517` BUSY_SNAPSHOT) so the retry policy can tell transient
/// contention from real failures.
impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            SqlxError::PoolTimedOut => {
                AppError::new("SQLX/POOL_TIMEOUT", "timed out waiting for a database connection")
            }
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "database pool is closed"),
            SqlxError::Io(err) => AppError::from(err),
            SqlxError::ColumnDecode { index, source } => AppError::new("SQLX/COLUMN_DECODE", source.to_string())
                .with_context("column", index.to_string()),
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context_and_cause() {
        let error = AppError::new(codes::EXHAUSTED_RETRIES, "backfill_commit failed after 4 attempts")
            .with_context("migration_id", "m-1")
            .with_cause(AppError::new(codes::BATCH_TIMEOUT, "exceeded 50 ms"));

        let shown = error.to_string();
        assert!(shown.starts_with("[MIGRATION/EXHAUSTED_RETRIES] backfill_commit failed"));
        assert!(shown.contains("\"migration_id\""));
        assert!(shown.ends_with(": [MIGRATION/BATCH_TIMEOUT] exceeded 50 ms"));
        assert_eq!(error.cause().map(AppError::code), Some(codes::BATCH_TIMEOUT));
    }

    #[test]
    fn sqlx_errors_keep_a_stable_code() {
        assert_eq!(AppError::from(SqlxError::PoolTimedOut).code(), "SQLX/POOL_TIMEOUT");
        assert_eq!(AppError::from(SqlxError::RowNotFound).code(), "SQLX/ERROR");
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"batch_size\": }").unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert_eq!(app_error.context().get("line").map(String::as_str), Some("1"));
    }

    #[test]
    fn fatal_and_blocking_classification() {
        assert!(AppError::new(codes::EXHAUSTED_RETRIES, "x").is_fatal());
        assert!(AppError::new(codes::FAILURE_THRESHOLD, "x").is_fatal());
        assert!(AppError::new(codes::SCHEMA_MISMATCH, "x").is_fatal());
        assert!(AppError::new(codes::CONSTRAINT_VIOLATION, "x").is_blocking());
        assert!(AppError::new(codes::INTEGRITY_MISMATCH, "x").is_blocking());
        assert!(!AppError::new(codes::BATCH_TIMEOUT, "x").is_fatal());
        assert!(!AppError::new(codes::CURSOR_CONFLICT, "x").is_blocking());
    }

    #[test]
    fn round_trips_through_the_metadata_store_json() {
        let error = AppError::new(codes::CONSTRAINT_VIOLATION, "orphans found")
            .with_context("orphan_keys", "17,2048");
        let json = serde_json::to_string(&error).unwrap();
        assert!(!json.contains("\"cause\""));
        assert_eq!(serde_json::from_str::<AppError>(&json).unwrap(), error);
    }
}
