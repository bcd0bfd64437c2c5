use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, Transaction};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::{AppError, AppResult};

/// Open a WAL-mode pool on `path`, creating the file when missing.
pub async fn open_sqlite_pool(path: &Path, max_connections: u32) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "tableshift",
                error = %e,
                event = "db_dir_create_failed",
                path = %parent.display()
            );
            AppError::from(e).with_context("path", parent.display().to_string())
        })?;
    }
    tracing::info!(target: "tableshift", event = "db_path", path = %path.display());

    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(5_000));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await
        .map_err(|e| {
            AppError::from(e)
                .with_context("operation", "open_sqlite_pool")
                .with_context("path", path.display().to_string())
        })?;

    log_effective_pragmas(&pool, path).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>, path: &Path) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "tableshift",
        event = "db_open",
        path = %path.display(),
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        synchronous = %sync.0,
        foreign_keys = %fks.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "tableshift",
            event = "db_open_warning",
            msg = "journal_mode != WAL; snapshot reads will block writers"
        );
    }
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, E, F>(pool: &Pool<Sqlite>, f: F) -> Result<R, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(
        &'c mut Transaction<'static, Sqlite>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'c>>,
{
    use tracing::{debug, error, warn};

    let mut tx = pool.begin().await.map_err(E::from)?;
    debug!(target: "tableshift", event = "db_tx_begin");
    match f(&mut tx).await {
        Ok(val) => {
            tx.commit().await.map_err(E::from)?;
            debug!(target: "tableshift", event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: "tableshift", event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target: "tableshift", event = "db_tx_rollback");
            }
            Err(e)
        }
    }
}
