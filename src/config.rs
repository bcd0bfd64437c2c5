use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::codes;
use crate::retry::RetryPolicy;
use crate::{AppError, AppResult};

pub const ENV_DATA_DB: &str = "TABLESHIFT_DATA_DB";
pub const ENV_METADATA_DB: &str = "TABLESHIFT_METADATA_DB";
pub const ENV_WORKERS: &str = "TABLESHIFT_WORKERS";

pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Fraction of source rows re-derived during verification.
    pub ratio: f64,
    /// Minimum sample size, capped at the row count.
    pub floor: u64,
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            ratio: 0.01,
            floor: 100,
            seed: 0x5eed,
        }
    }
}

impl SampleConfig {
    pub fn size_for(&self, rows: u64) -> u64 {
        let by_ratio = (self.ratio * rows as f64).ceil() as u64;
        by_ratio.max(self.floor).min(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_db: PathBuf,
    pub metadata_db: PathBuf,
    pub workers: usize,
    pub batch_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_failed_rows: u64,
    pub sample: SampleConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_db: PathBuf::from("data.sqlite3"),
            metadata_db: PathBuf::from("tableshift.sqlite3"),
            workers: 4,
            batch_timeout_ms: 30_000,
            verify_timeout_ms: 120_000,
            max_retries: 3,
            retry_backoff_ms: 200,
            max_backoff_ms: 5_000,
            max_failed_rows: 100,
            sample: SampleConfig::default(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "config_load")
                        .with_context("path", path.display().to_string())
                })?;
                serde_json::from_str(&raw).map_err(|err| {
                    AppError::new(codes::CONFIG_INVALID, err.to_string())
                        .with_context("path", path.display().to_string())
                })?
            }
            None => EngineConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATA_DB).filter(|v| !v.is_empty()) {
            self.data_db = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_METADATA_DB).filter(|v| !v.is_empty()) {
            self.metadata_db = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.workers = raw.trim().parse().map_err(|_| {
                AppError::new(codes::CONFIG_INVALID, format!("{ENV_WORKERS} must be an integer"))
                    .with_context("value", raw.clone())
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        let invalid = |message: &str| -> AppResult<()> {
            Err(AppError::new(codes::CONFIG_INVALID, message.to_string()))
        };
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return invalid("workers must be between 1 and 64");
        }
        if self.batch_timeout_ms == 0 || self.verify_timeout_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.retry_backoff_ms > self.max_backoff_ms {
            return invalid("retry_backoff_ms must not exceed max_backoff_ms");
        }
        if !(self.sample.ratio > 0.0 && self.sample.ratio <= 1.0) {
            return invalid("sample.ratio must be in (0, 1]");
        }
        if self.data_db == self.metadata_db {
            return invalid("metadata_db must be separate from data_db");
        }
        Ok(())
    }

    pub fn batch_retry(&self) -> RetryPolicy {
        self.retry_policy(self.batch_timeout_ms)
    }

    pub fn verify_retry(&self) -> RetryPolicy {
        self.retry_policy(self.verify_timeout_ms)
    }

    fn retry_policy(&self, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(timeout_ms),
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workers": 8, "sample": {"floor": 5}}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.sample.floor, 5);
        assert_eq!(config.sample.seed, 0x5eed);
        assert_eq!(config.max_failed_rows, 100);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> =
            [(ENV_WORKERS, "2"), (ENV_DATA_DB, "/tmp/listings.db")].into_iter().collect();
        let mut config = EngineConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.data_db, PathBuf::from("/tmp/listings.db"));

        let err = config
            .apply_env(|key| (key == ENV_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn validation_rejects_shared_databases_and_zero_workers() {
        let mut config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        config.workers = 1;
        config.metadata_db = config.data_db.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_size_uses_floor_and_caps_at_count() {
        let sample = SampleConfig::default();
        assert_eq!(sample.size_for(10_000), 100);
        assert_eq!(sample.size_for(50_000), 500);
        assert_eq!(sample.size_for(40), 40);
        assert_eq!(sample.size_for(0), 0);
    }
}
