//! Durable migration metadata, kept in its own SQLite database so it survives
//! restarts and never shares a file with the tables being migrated.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::backfill::{BackfillCursor, BackfillPhase, QuarantinedRow};
use crate::error::codes;
use crate::plan::{ConstraintChange, MigrationPlan};
use crate::state::MigrationState;
use crate::time::now_ms;
use crate::value::Value;
use crate::verify::VerificationReport;
use crate::{db, migrate, AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub source_table: String,
    pub target_table: String,
    pub logical_name: String,
    pub plan: MigrationPlan,
    pub state: MigrationState,
    pub error: Option<AppError>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: Option<MigrationState>,
    pub to: MigrationState,
    pub at: i64,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

fn key_json(key: &Value) -> AppResult<String> {
    Ok(serde_json::to_string(key)?)
}

fn not_found(id: Uuid) -> AppError {
    AppError::new(codes::NOT_FOUND, "Migration not found.").with_context("migration_id", id.to_string())
}

fn cursor_from_row(id: Uuid, row: &SqliteRow) -> AppResult<BackfillCursor> {
    let last: Option<String> = row.try_get("last_processed_key_json")?;
    let phase: String = row.try_get("phase")?;
    Ok(BackfillCursor {
        migration_id: id,
        last_processed_key: last.as_deref().map(serde_json::from_str).transpose()?,
        rows_processed: row.try_get::<i64, _>("rows_processed")?.max(0) as u64,
        rows_failed: row.try_get::<i64, _>("rows_failed")?.max(0) as u64,
        batches_committed: row.try_get::<i64, _>("batches_committed")?.max(0) as u64,
        phase: BackfillPhase::parse(&phase).unwrap_or(BackfillPhase::Pending),
        archived_at: row.try_get("archived_at")?,
    })
}

impl MetadataStore {
    pub async fn open(path: &Path) -> AppResult<Self> {
        let pool = db::open_sqlite_pool(path, 4).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> AppResult<Self> {
        migrate::apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a new migration in `Planned`. Refuses when another migration
    /// of the same table pair is still in flight or awaiting rollback.
    pub async fn create_migration(&self, id: Uuid, plan: &MigrationPlan) -> AppResult<MigrationRecord> {
        let now = now_ms();
        let plan_json = serde_json::to_string(plan)?;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, state FROM migrations WHERE source_table = ?1 AND target_table = ?2",
        )
        .bind(&plan.source.table)
        .bind(&plan.target.name)
        .fetch_all(&mut *tx)
        .await?;
        for row in existing {
            let state: MigrationState = row.try_get::<String, _>("state")?.parse()?;
            if state.holds_table_pair() {
                let other: String = row.try_get("id")?;
                return Err(AppError::new(
                    codes::ALREADY_RUNNING,
                    "Another migration of this table pair has not finished.",
                )
                .with_context("existing_migration_id", other)
                .with_context("state", state.as_str())
                .with_context("source_table", plan.source.table.clone())
                .with_context("target_table", plan.target.name.clone()));
            }
        }

        sqlx::query(
            "INSERT INTO migrations (id, source_table, target_table, logical_name, plan_json, state, error_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)",
        )
        .bind(id.to_string())
        .bind(&plan.source.table)
        .bind(&plan.target.name)
        .bind(plan.logical_name())
        .bind(&plan_json)
        .bind(MigrationState::Planned.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO state_history (migration_id, from_state, to_state, at) VALUES (?1, NULL, ?2, ?3)",
        )
        .bind(id.to_string())
        .bind(MigrationState::Planned.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO backfill_cursors (migration_id, phase, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(id.to_string())
        .bind(BackfillPhase::Pending.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO active_tables (logical_name, table_name, generation, updated_at) VALUES (?1, ?2, 0, ?3)",
        )
        .bind(plan.logical_name())
        .bind(&plan.source.table)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            target: "tableshift",
            event = "migration_created",
            migration_id = %id,
            source = %plan.source.table,
            target = %plan.target.name
        );
        self.load_migration(id).await
    }

    pub async fn load_migration(&self, id: Uuid) -> AppResult<MigrationRecord> {
        let row = sqlx::query(
            "SELECT source_table, target_table, logical_name, plan_json, state, error_json, created_at, updated_at
             FROM migrations WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(id))?;
        let plan_json: String = row.try_get("plan_json")?;
        let error_json: Option<String> = row.try_get("error_json")?;
        Ok(MigrationRecord {
            id,
            source_table: row.try_get("source_table")?,
            target_table: row.try_get("target_table")?,
            logical_name: row.try_get("logical_name")?,
            plan: serde_json::from_str(&plan_json)?,
            state: row.try_get::<String, _>("state")?.parse()?,
            error: error_json.as_deref().map(serde_json::from_str).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn list_migrations(&self) -> AppResult<Vec<(Uuid, MigrationState)>> {
        let rows = sqlx::query("SELECT id, state FROM migrations ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let id = Uuid::parse_str(&id)
                .map_err(|err| AppError::new("STORE/CORRUPT_ID", err.to_string()))?;
            out.push((id, row.try_get::<String, _>("state")?.parse()?));
        }
        Ok(out)
    }

    async fn transition_in(
        tx: &mut Transaction<'static, Sqlite>,
        id: Uuid,
        from: MigrationState,
        to: MigrationState,
        error: Option<&AppError>,
    ) -> AppResult<()> {
        from.transition(to)?;
        let now = now_ms();
        let error_json = error.map(serde_json::to_string).transpose()?;
        let updated = sqlx::query(
            "UPDATE migrations SET state = ?1, error_json = ?2, updated_at = ?3 WHERE id = ?4 AND state = ?5",
        )
        .bind(to.as_str())
        .bind(error_json)
        .bind(now)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(AppError::new(
                codes::ILLEGAL_TRANSITION,
                "Migration state changed concurrently.",
            )
            .with_context("migration_id", id.to_string())
            .with_context("expected_state", from.as_str()));
        }
        sqlx::query(
            "INSERT INTO state_history (migration_id, from_state, to_state, at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn log_transition(id: Uuid, from: MigrationState, to: MigrationState) {
        info!(
            target: "tableshift",
            event = "migration_state_changed",
            migration_id = %id,
            from = %from,
            to = %to
        );
    }

    pub async fn transition(&self, id: Uuid, from: MigrationState, to: MigrationState) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::transition_in(&mut tx, id, from, to, None).await?;
        tx.commit().await?;
        Self::log_transition(id, from, to);
        Ok(())
    }

    /// Move to `Failed`, keeping the error for `describe`.
    pub async fn mark_failed(&self, id: Uuid, from: MigrationState, error: &AppError) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::transition_in(&mut tx, id, from, MigrationState::Failed, Some(error)).await?;
        tx.commit().await?;
        Self::log_transition(id, from, MigrationState::Failed);
        Ok(())
    }

    /// Record (or clear) the error that currently blocks a migration.
    pub async fn record_error(&self, id: Uuid, error: Option<&AppError>) -> AppResult<()> {
        let error_json = error.map(serde_json::to_string).transpose()?;
        sqlx::query("UPDATE migrations SET error_json = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(error_json)
            .bind(now_ms())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn history(&self, id: Uuid) -> AppResult<Vec<StateChange>> {
        let rows = sqlx::query(
            "SELECT from_state, to_state, at FROM state_history WHERE migration_id = ?1 ORDER BY id",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> AppResult<StateChange> {
                let from: Option<String> = row.try_get("from_state")?;
                Ok(StateChange {
                    from: from.as_deref().map(str::parse).transpose()?,
                    to: row.try_get::<String, _>("to_state")?.parse()?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }

    pub async fn load_cursor(&self, id: Uuid) -> AppResult<BackfillCursor> {
        let row = sqlx::query(
            "SELECT last_processed_key_json, rows_processed, rows_failed, batches_committed, phase, archived_at
             FROM backfill_cursors WHERE migration_id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found(id))?;
        cursor_from_row(id, &row)
    }

    pub async fn set_cursor_phase(&self, id: Uuid, phase: BackfillPhase) -> AppResult<()> {
        sqlx::query("UPDATE backfill_cursors SET phase = ?1, updated_at = ?2 WHERE migration_id = ?3")
            .bind(phase.as_str())
            .bind(now_ms())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a committed batch `(after, through]`: its quarantined rows and
    /// the advanced cursor, in one transaction. Counters move by deltas so
    /// concurrent mirror adjustments are kept. The cursor only moves from
    /// `after`; a checkpoint that already landed returns the stored cursor
    /// unchanged.
    pub async fn commit_checkpoint(
        &self,
        id: Uuid,
        after: Option<&Value>,
        through: &Value,
        rows_written: u64,
        failures: &[QuarantinedRow],
    ) -> AppResult<BackfillCursor> {
        let now = now_ms();
        let after_json = after.map(key_json).transpose()?;
        let through_json = key_json(through)?;
        let mut tx = self.pool.begin().await?;
        let mut newly_failed = 0i64;
        for failure in failures {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO backfill_failures (migration_id, row_key_json, column_name, error_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(id.to_string())
            .bind(key_json(&failure.key)?)
            .bind(&failure.column)
            .bind(serde_json::to_string(&failure.error)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            newly_failed += inserted.rows_affected() as i64;
        }
        let advanced = sqlx::query(
            "UPDATE backfill_cursors
             SET last_processed_key_json = ?1,
                 rows_processed = rows_processed + ?2,
                 rows_failed = rows_failed + ?3,
                 batches_committed = batches_committed + 1,
                 phase = ?4,
                 updated_at = ?5
             WHERE migration_id = ?6 AND last_processed_key_json IS ?7",
        )
        .bind(&through_json)
        .bind(rows_written as i64)
        .bind(newly_failed)
        .bind(BackfillPhase::Running.as_str())
        .bind(now)
        .bind(id.to_string())
        .bind(&after_json)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let row = sqlx::query(
            "SELECT last_processed_key_json, rows_processed, rows_failed, batches_committed, phase, archived_at
             FROM backfill_cursors WHERE migration_id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| not_found(id))?;
        let stored: Option<String> = row.try_get("last_processed_key_json")?;
        let cursor = cursor_from_row(id, &row)?;
        if advanced == 0 {
            // Dropping the transaction discards the failure rows inserted above.
            if stored.as_deref() == Some(through_json.as_str()) {
                info!(target: "tableshift", event = "backfill_checkpoint_replayed", migration_id = %id, last_key = %through);
                return Ok(cursor);
            }
            return Err(AppError::new(
                codes::CURSOR_CONFLICT,
                "Backfill cursor moved underneath this batch.",
            )
            .with_context("migration_id", id.to_string())
            .with_context("expected_after", after_json.unwrap_or_else(|| "null".into()))
            .with_context("stored", stored.unwrap_or_else(|| "null".into())));
        }
        tx.commit().await?;
        Ok(cursor)
    }

    /// Bring one key's quarantine entry and the counters in line with a row
    /// that was re-derived outside the batch loop.
    pub async fn reconcile_row(
        &self,
        id: Uuid,
        key: &Value,
        quarantine: Option<&QuarantinedRow>,
        processed_delta: i64,
    ) -> AppResult<()> {
        let key = key_json(key)?;
        let mut tx = self.pool.begin().await?;
        let was_quarantined = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM backfill_failures WHERE migration_id = ?1 AND row_key_json = ?2",
        )
        .bind(id.to_string())
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
        let failed_delta = match quarantine {
            Some(failure) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO backfill_failures (migration_id, row_key_json, column_name, error_json, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(id.to_string())
                .bind(&key)
                .bind(&failure.column)
                .bind(serde_json::to_string(&failure.error)?)
                .bind(now_ms())
                .execute(&mut *tx)
                .await?;
                i64::from(!was_quarantined)
            }
            None => {
                sqlx::query("DELETE FROM backfill_failures WHERE migration_id = ?1 AND row_key_json = ?2")
                    .bind(id.to_string())
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;
                -i64::from(was_quarantined)
            }
        };
        sqlx::query(
            "UPDATE backfill_cursors
             SET rows_processed = MAX(rows_processed + ?1, 0),
                 rows_failed = MAX(rows_failed + ?2, 0),
                 updated_at = ?3
             WHERE migration_id = ?4",
        )
        .bind(processed_delta)
        .bind(failed_delta)
        .bind(now_ms())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn quarantined(&self, id: Uuid) -> AppResult<Vec<QuarantinedRow>> {
        let rows = sqlx::query(
            "SELECT row_key_json, column_name, error_json FROM backfill_failures
             WHERE migration_id = ?1 ORDER BY recorded_at, row_key_json",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> AppResult<QuarantinedRow> {
                let key: String = row.try_get("row_key_json")?;
                let error: String = row.try_get("error_json")?;
                Ok(QuarantinedRow {
                    key: serde_json::from_str(&key)?,
                    column: row.try_get("column_name")?,
                    error: serde_json::from_str(&error)?,
                })
            })
            .collect()
    }

    /// Canonical encodings of every quarantined key.
    pub async fn quarantined_keys(&self, id: Uuid) -> AppResult<HashSet<String>> {
        Ok(self
            .quarantined(id)
            .await?
            .into_iter()
            .map(|row| row.key.canonical())
            .collect())
    }

    pub async fn is_quarantined(&self, id: Uuid, key: &Value) -> AppResult<bool> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM backfill_failures WHERE migration_id = ?1 AND row_key_json = ?2",
        )
        .bind(id.to_string())
        .bind(key_json(key)?)
        .fetch_optional(&self.pool)
        .await?
        .is_some())
    }

    /// Store a verification report under the next attempt number.
    pub async fn save_report(&self, report: &VerificationReport) -> AppResult<u32> {
        let id = report.migration_id().to_string();
        let mut tx = self.pool.begin().await?;
        let attempt: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt), 0) + 1 FROM verification_reports WHERE migration_id = ?1",
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO verification_reports (migration_id, attempt, passed, report_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(attempt)
        .bind(report.passed())
        .bind(serde_json::to_string(report)?)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(attempt as u32)
    }

    pub async fn latest_report(&self, id: Uuid) -> AppResult<Option<(u32, VerificationReport)>> {
        let row = sqlx::query(
            "SELECT attempt, report_json FROM verification_reports
             WHERE migration_id = ?1 ORDER BY attempt DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("report_json")?;
                Ok(Some((row.try_get::<i64, _>("attempt")? as u32, serde_json::from_str(&json)?)))
            }
            None => Ok(None),
        }
    }

    pub async fn record_constraint(&self, id: Uuid, name: &str, change: &ConstraintChange) -> AppResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO applied_constraints (migration_id, name, change_json, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(serde_json::to_string(change)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn applied_constraints(&self, id: Uuid) -> AppResult<Vec<(String, ConstraintChange)>> {
        let rows = sqlx::query(
            "SELECT name, change_json FROM applied_constraints WHERE migration_id = ?1 ORDER BY applied_at, name",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> AppResult<(String, ConstraintChange)> {
                let json: String = row.try_get("change_json")?;
                Ok((row.try_get("name")?, serde_json::from_str(&json)?))
            })
            .collect()
    }

    pub async fn forget_constraint(&self, id: Uuid, name: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM applied_constraints WHERE migration_id = ?1 AND name = ?2")
            .bind(id.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Archive the cursor and move to `to` atomically.
    pub async fn archive_and_transition(
        &self,
        id: Uuid,
        from: MigrationState,
        to: MigrationState,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE backfill_cursors SET archived_at = ?1, updated_at = ?1 WHERE migration_id = ?2 AND archived_at IS NULL",
        )
        .bind(now_ms())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        Self::transition_in(&mut tx, id, from, to, None).await?;
        tx.commit().await?;
        Self::log_transition(id, from, to);
        Ok(())
    }

    pub async fn designation(&self, logical_name: &str) -> AppResult<Option<(String, u64)>> {
        let row = sqlx::query("SELECT table_name, generation FROM active_tables WHERE logical_name = ?1")
            .bind(logical_name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some((
                row.try_get("table_name")?,
                row.try_get::<i64, _>("generation")?.max(0) as u64,
            ))),
            None => Ok(None),
        }
    }

    /// Compare-and-swap the persisted designation together with a state
    /// change. Returns the new generation.
    pub async fn swap_designation(
        &self,
        id: Uuid,
        from: MigrationState,
        to: MigrationState,
        logical_name: &str,
        expected_table: &str,
        new_table: &str,
    ) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE active_tables
             SET table_name = ?1, previous_table = table_name, generation = generation + 1, updated_at = ?2
             WHERE logical_name = ?3 AND table_name = ?4",
        )
        .bind(new_table)
        .bind(now_ms())
        .bind(logical_name)
        .bind(expected_table)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(AppError::new(
                codes::ROUTER_CAS_CONFLICT,
                "Persisted designation does not match the expected table.",
            )
            .with_context("logical_name", logical_name)
            .with_context("expected", expected_table)
            .with_context("migration_id", id.to_string()));
        }
        let generation: i64 =
            sqlx::query_scalar("SELECT generation FROM active_tables WHERE logical_name = ?1")
                .bind(logical_name)
                .fetch_one(&mut *tx)
                .await?;
        Self::transition_in(&mut tx, id, from, to, None).await?;
        tx.commit().await?;
        Self::log_transition(id, from, to);
        Ok(generation.max(0) as u64)
    }
}
