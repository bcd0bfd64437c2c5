use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use crate::{AppError, AppResult};
use tracing::{error, info};

/// Migration code for schema drift in the metadata store.
pub const CHECKSUM_MISMATCH: &str = "STORE/MIGRATION_EDITED";

static ADD_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)").expect("add column regex")
});

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(160) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_migrations.sql",
        include_str!("../migrations/0001_migrations.sql"),
    ),
    (
        "0002_backfill.sql",
        include_str!("../migrations/0002_backfill.sql"),
    ),
    (
        "0003_activation.sql",
        include_str!("../migrations/0003_activation.sql"),
    ),
    (
        "0004_failure_detail.sql",
        include_str!("../migrations/0004_failure_detail.sql"),
    ),
];

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Bring the metadata store schema up to date. Files already applied are
/// skipped; a file whose checksum no longer matches is refused.
pub async fn apply_migrations(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        applied.insert(r.try_get("version")?, r.try_get("checksum")?);
    }

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let checksum = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                return Err(AppError::new(
                    CHECKSUM_MISMATCH,
                    format!("migration {filename} edited after application"),
                )
                .with_context("file", *filename));
            }
            info!(target: "tableshift", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            if let Some(caps) = ADD_COLUMN_RE.captures(s) {
                let exists: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2",
                )
                .bind(&caps[1])
                .bind(&caps[2])
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "tableshift", event = "migration_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target: "tableshift", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "tableshift", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(AppError::from(e).with_context("file", *filename));
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "tableshift", event = "migration_file_applied", file = %filename);
    }

    Ok(())
}
