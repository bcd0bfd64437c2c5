use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use super::{BackfillCursor, BatchResult, QuarantinedRow};
use crate::derive::{derive, DerivationError};
use crate::plan::MigrationPlan;
use crate::schema::quote_ident;
use crate::store::MetadataStore;
use crate::value::{bind_value, decode_column, SourceRow, Value};
use crate::AppResult;

/// Key range `(after, through]` claimed by one batch before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRange {
    pub sequence: u64,
    pub after: Option<Value>,
    pub through: Value,
}

impl BatchRange {
    pub fn contains(&self, key: &Value) -> bool {
        let above = self.after.as_ref().map_or(true, |after| key.sql_cmp(after).is_gt());
        above && key.sql_cmp(&self.through).is_le()
    }
}

/// Derived values for one target row, in `plan.mappings` order.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub key: Value,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct DerivedBatch {
    pub range: BatchRange,
    pub rows_read: u64,
    pub rows: Vec<TargetRow>,
    pub failures: Vec<QuarantinedRow>,
}

impl DerivedBatch {
    pub fn derive(plan: &MigrationPlan, range: BatchRange, source: Vec<SourceRow>) -> Self {
        let rows_read = source.len() as u64;
        let mut rows = Vec::with_capacity(source.len());
        let mut failures = Vec::new();
        for row in &source {
            match derive_row(plan, row) {
                Ok(target) => rows.push(target),
                Err(failure) => {
                    warn!(
                        target: "tableshift",
                        event = "backfill_row_quarantined",
                        key = %failure.key,
                        column = %failure.column,
                        error = %failure.error
                    );
                    failures.push(failure);
                }
            }
        }
        Self {
            range,
            rows_read,
            rows,
            failures,
        }
    }

    /// Drop whatever this batch holds for `key`.
    pub fn forget(&mut self, key: &Value) {
        self.rows.retain(|row| row.key != *key);
        self.failures.retain(|row| row.key != *key);
    }

    pub fn failed_keys(&self) -> Vec<Value> {
        self.failures.iter().map(|f| f.key.clone()).collect()
    }
}

/// Apply every mapping to one source row and coerce into the target types.
/// The first failing column quarantines the whole row.
pub fn derive_row(plan: &MigrationPlan, row: &SourceRow) -> Result<TargetRow, QuarantinedRow> {
    let mut values = Vec::with_capacity(plan.mappings.len());
    for mapping in &plan.mappings {
        let derived = derive(row, mapping).and_then(|value| match plan.target.column(&mapping.target_column) {
            Some(column) => column.coerce(value),
            None => Err(DerivationError::MissingField {
                column: mapping.target_column.clone(),
            }),
        });
        match derived {
            Ok(value) => values.push(value),
            Err(error) => {
                return Err(QuarantinedRow {
                    key: row.key.clone(),
                    column: mapping.target_column.clone(),
                    error,
                });
            }
        }
    }
    Ok(TargetRow {
        key: row.key.clone(),
        values,
    })
}

/// Source rows with `after < key <= through`, ordered by key.
pub async fn read_range(
    pool: &SqlitePool,
    plan: &MigrationPlan,
    after: Option<&Value>,
    through: Option<&Value>,
    limit: Option<u32>,
) -> AppResult<Vec<SourceRow>> {
    let pk = quote_ident(&plan.source.primary_key);
    let mut sql = format!("SELECT * FROM {}", quote_ident(&plan.source.table));
    let mut clauses = Vec::new();
    if after.is_some() {
        clauses.push(format!("{pk} > ?"));
    }
    if through.is_some() {
        clauses.push(format!("{pk} <= ?"));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {pk}"));
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut query = sqlx::query(&sql);
    for bound in [after, through].into_iter().flatten() {
        query = bind_value(query, bound);
    }
    let rows = query.fetch_all(pool).await?;
    rows.iter()
        .map(|row| SourceRow::from_sqlite(row, &plan.source.primary_key).map_err(Into::into))
        .collect()
}

/// Upper key of the next batch after `after`: the `batch_size`-th key, or
/// the last key when fewer remain. `None` once the source is exhausted.
pub async fn next_boundary(
    pool: &SqlitePool,
    plan: &MigrationPlan,
    after: Option<&Value>,
) -> AppResult<Option<Value>> {
    let pk = quote_ident(&plan.source.primary_key);
    let table = quote_ident(&plan.source.table);
    let filter = if after.is_some() {
        format!(" WHERE {pk} > ?")
    } else {
        String::new()
    };

    let nth = format!(
        "SELECT {pk} FROM {table}{filter} ORDER BY {pk} LIMIT 1 OFFSET {}",
        plan.batch_size.saturating_sub(1)
    );
    let mut query = sqlx::query(&nth);
    if let Some(after) = after {
        query = bind_value(query, after);
    }
    if let Some(row) = query.fetch_optional(pool).await? {
        return Ok(Some(decode_column(&row, 0)?));
    }

    let last = format!("SELECT {pk} FROM {table}{filter} ORDER BY {pk} DESC LIMIT 1");
    let mut query = sqlx::query(&last);
    if let Some(after) = after {
        query = bind_value(query, after);
    }
    match query.fetch_optional(pool).await? {
        Some(row) => Ok(Some(decode_column(&row, 0)?)),
        None => Ok(None),
    }
}

pub async fn fetch_source_row(
    pool: &SqlitePool,
    plan: &MigrationPlan,
    key: &Value,
) -> AppResult<Option<SourceRow>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?",
        quote_ident(&plan.source.table),
        quote_ident(&plan.source.primary_key)
    );
    let row = bind_value(sqlx::query(&sql), key).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(SourceRow::from_sqlite(&row, &plan.source.primary_key)?)),
        None => Ok(None),
    }
}

pub async fn target_row_exists(pool: &SqlitePool, plan: &MigrationPlan, key: &Value) -> AppResult<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = ?",
        quote_ident(&plan.target.name),
        quote_ident(&plan.target.primary_key)
    );
    Ok(bind_value(sqlx::query(&sql), key)
        .fetch_optional(pool)
        .await?
        .is_some())
}

fn upsert_sql(plan: &MigrationPlan) -> String {
    let columns: Vec<String> = plan
        .mappings
        .iter()
        .map(|m| quote_ident(&m.target_column))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = plan
        .mappings
        .iter()
        .filter(|m| m.target_column != plan.target.primary_key)
        .map(|m| {
            let col = quote_ident(&m.target_column);
            format!("{col} = excluded.{col}")
        })
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(&plan.target.name),
        columns.join(", "),
        placeholders.join(", "),
        quote_ident(&plan.target.primary_key),
        conflict
    )
}

/// Idempotent write of derived rows keyed by the primary key.
pub async fn upsert_rows(conn: &mut SqliteConnection, plan: &MigrationPlan, rows: &[TargetRow]) -> AppResult<u64> {
    let sql = upsert_sql(plan);
    for row in rows {
        let mut query = sqlx::query(&sql);
        for value in &row.values {
            query = bind_value(query, value);
        }
        query.execute(&mut *conn).await?;
    }
    Ok(rows.len() as u64)
}

pub async fn delete_target_rows(conn: &mut SqliteConnection, plan: &MigrationPlan, keys: &[Value]) -> AppResult<u64> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(&plan.target.name),
        quote_ident(&plan.target.primary_key)
    );
    let mut removed = 0;
    for key in keys {
        removed += bind_value(sqlx::query(&sql), key)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

/// Write a derived batch to the target in one transaction. Keys that failed
/// derivation or vanished from the source are removed from the target.
pub(crate) async fn commit_target(
    pool: &SqlitePool,
    plan: &MigrationPlan,
    rows: &[TargetRow],
    remove: &[Value],
) -> AppResult<u64> {
    let mut tx = pool.begin().await?;
    let written = upsert_rows(&mut tx, plan, rows).await?;
    delete_target_rows(&mut tx, plan, remove).await?;
    tx.commit().await?;
    Ok(written)
}

/// Process the next `batch_size` rows after `cursor`: derive, upsert into the
/// target, then persist the advanced cursor. Returns the cursor unchanged and
/// an empty result once the source is exhausted.
pub async fn run_batch(
    data: &SqlitePool,
    store: &MetadataStore,
    plan: &MigrationPlan,
    cursor: &BackfillCursor,
) -> AppResult<(BackfillCursor, BatchResult)> {
    let source = read_range(
        data,
        plan,
        cursor.last_processed_key.as_ref(),
        None,
        Some(plan.batch_size),
    )
    .await?;
    let Some(through) = source.last().map(|row| row.key.clone()) else {
        return Ok((
            cursor.clone(),
            BatchResult {
                sequence: cursor.batches_committed,
                rows_read: 0,
                rows_written: 0,
                rows_quarantined: 0,
                last_key: None,
            },
        ));
    };
    let range = BatchRange {
        sequence: cursor.batches_committed,
        after: cursor.last_processed_key.clone(),
        through: through.clone(),
    };
    let batch = DerivedBatch::derive(plan, range, source);
    let written = commit_target(data, plan, &batch.rows, &batch.failed_keys()).await?;
    let next = store
        .commit_checkpoint(
            cursor.migration_id,
            cursor.last_processed_key.as_ref(),
            &through,
            written,
            &batch.failures,
        )
        .await?;
    log_commit(cursor.migration_id, &next, written, batch.failures.len() as u64);
    Ok((
        next,
        BatchResult {
            sequence: batch.range.sequence,
            rows_read: batch.rows_read,
            rows_written: written,
            rows_quarantined: batch.failures.len() as u64,
            last_key: Some(through),
        },
    ))
}

pub(crate) fn log_commit(id: Uuid, cursor: &BackfillCursor, written: u64, quarantined: u64) {
    info!(
        target: "tableshift",
        event = "backfill_batch_committed",
        migration_id = %id,
        batch = cursor.batches_committed,
        rows_written = written,
        rows_quarantined = quarantined,
        rows_processed = cursor.rows_processed,
        rows_failed = cursor.rows_failed,
        last_key = %cursor.last_processed_key.as_ref().map(|key| key.to_string()).unwrap_or_default()
    );
}
