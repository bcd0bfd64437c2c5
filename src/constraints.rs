//! Foreign-key and check constraints added to (or dropped from) the target
//! table. SQLite cannot add constraints to an existing table, so they are
//! enforced with triggers whose names derive from the table and column.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::error::codes;
use crate::plan::{CheckPredicate, ConstraintChange, ConstraintKind, ForeignKeyRef, OnDelete};
use crate::schema::{quote_ident, sql_literal};
use crate::value::{decode_column, Value};
use crate::{db, AppError};

/// Offending rows listed in a report; `orphan_count` is always exact.
pub const ORPHAN_SAMPLE_LIMIT: u32 = 1000;

/// Marker carried by every message raised from an enforcement trigger.
pub const TRIGGER_MESSAGE_PREFIX: &str = "tableshift:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orphan {
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub change: ConstraintChange,
    pub checked_rows: u64,
    pub orphan_count: u64,
    pub orphans: Vec<Orphan>,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_count == 0
    }
}

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("{} rows violate {}", .report.orphan_count, .report.change.label())]
    Violations { report: OrphanReport },
    #[error("{label} is missing {what}")]
    Incomplete { label: String, what: &'static str },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<ConstraintError> for AppError {
    fn from(error: ConstraintError) -> Self {
        match error {
            ConstraintError::Violations { report } => {
                let keys: Vec<String> = report
                    .orphans
                    .iter()
                    .take(20)
                    .map(|orphan| orphan.key.to_string())
                    .collect();
                AppError::new(
                    codes::CONSTRAINT_VIOLATION,
                    format!("{} rows violate {}", report.orphan_count, report.change.label()),
                )
                .with_context("constraint", report.change.label())
                .with_context("orphan_count", report.orphan_count.to_string())
                .with_context("orphan_keys", keys.join(","))
            }
            ConstraintError::Incomplete { .. } => AppError::new(codes::PLAN_INVALID, error.to_string()),
            ConstraintError::Database(err) => AppError::from(err),
        }
    }
}

/// True when `err` came from one of our enforcement triggers.
pub fn is_trigger_violation(err: &AppError) -> bool {
    err.message().contains(TRIGGER_MESSAGE_PREFIX)
}

/// Stable name shared by the triggers of one change, e.g.
/// `tableshift_fk_listings_v2_host_id`.
pub fn constraint_name(change: &ConstraintChange) -> String {
    let family = if change.kind.is_fk() { "fk" } else { "ck" };
    format!("tableshift_{family}_{}_{}", change.table, change.column)
}

pub fn trigger_names(change: &ConstraintChange) -> Vec<String> {
    let base = constraint_name(change);
    let suffixes: &[&str] = if change.kind.is_fk() {
        &["ins", "upd", "del"]
    } else {
        &["ins", "upd"]
    };
    suffixes.iter().map(|suffix| format!("{base}_{suffix}")).collect()
}

fn parent_of(change: &ConstraintChange) -> Result<&ForeignKeyRef, ConstraintError> {
    change.references.as_ref().ok_or_else(|| ConstraintError::Incomplete {
        label: change.label(),
        what: "references",
    })
}

fn check_of(change: &ConstraintChange) -> Result<&CheckPredicate, ConstraintError> {
    change.check.as_ref().ok_or_else(|| ConstraintError::Incomplete {
        label: change.label(),
        what: "check",
    })
}

/// SQL expression that holds when `expr` satisfies `check`. NULL passes every
/// check except `not_null`.
fn predicate_sql(check: &CheckPredicate, expr: &str) -> String {
    match check {
        CheckPredicate::NotNull => format!("{expr} IS NOT NULL"),
        CheckPredicate::Range { min, max } => {
            let mut bounds = Vec::new();
            if let Some(min) = min {
                bounds.push(format!("{expr} >= {min:?}"));
            }
            if let Some(max) = max {
                bounds.push(format!("{expr} <= {max:?}"));
            }
            if bounds.is_empty() {
                return "1".to_string();
            }
            format!("({expr} IS NULL OR ({}))", bounds.join(" AND "))
        }
        CheckPredicate::OneOf { values } => {
            let list: Vec<String> = values.iter().map(sql_literal).collect();
            format!("({expr} IS NULL OR {expr} IN ({}))", list.join(", "))
        }
    }
}

fn raise(kind: &str, change: &ConstraintChange) -> String {
    format!(
        "SELECT RAISE(ABORT, '{TRIGGER_MESSAGE_PREFIX} {kind} violation on {}.{}')",
        change.table, change.column
    )
}

fn trigger_sql(change: &ConstraintChange) -> Result<Vec<String>, ConstraintError> {
    let names = trigger_names(change);
    let table = quote_ident(&change.table);
    let column = quote_ident(&change.column);

    if change.kind.is_fk() {
        let parent = parent_of(change)?;
        let ptable = quote_ident(&parent.table);
        let pcolumn = quote_ident(&parent.column);
        let missing_parent = format!(
            "NEW.{column} IS NOT NULL AND NOT EXISTS (SELECT 1 FROM {ptable} WHERE {pcolumn} = NEW.{column})"
        );
        let guard = raise("foreign key", change);
        let on_delete = match change.on_delete.unwrap_or_default() {
            OnDelete::Cascade => format!(
                "CREATE TRIGGER {} AFTER DELETE ON {ptable} FOR EACH ROW \
                 WHEN NOT EXISTS (SELECT 1 FROM {ptable} WHERE {pcolumn} = OLD.{pcolumn}) \
                 BEGIN DELETE FROM {table} WHERE {column} = OLD.{pcolumn}; END",
                quote_ident(&names[2])
            ),
            OnDelete::SetNull => format!(
                "CREATE TRIGGER {} AFTER DELETE ON {ptable} FOR EACH ROW \
                 WHEN NOT EXISTS (SELECT 1 FROM {ptable} WHERE {pcolumn} = OLD.{pcolumn}) \
                 BEGIN UPDATE {table} SET {column} = NULL WHERE {column} = OLD.{pcolumn}; END",
                quote_ident(&names[2])
            ),
            OnDelete::Restrict | OnDelete::NoAction => format!(
                "CREATE TRIGGER {} BEFORE DELETE ON {ptable} FOR EACH ROW \
                 WHEN EXISTS (SELECT 1 FROM {table} WHERE {column} = OLD.{pcolumn}) \
                 BEGIN {}; END",
                quote_ident(&names[2]),
                raise("foreign key", change)
            ),
        };
        Ok(vec![
            format!(
                "CREATE TRIGGER {} BEFORE INSERT ON {table} FOR EACH ROW WHEN {missing_parent} BEGIN {guard}; END",
                quote_ident(&names[0])
            ),
            format!(
                "CREATE TRIGGER {} BEFORE UPDATE OF {column} ON {table} FOR EACH ROW WHEN {missing_parent} BEGIN {guard}; END",
                quote_ident(&names[1])
            ),
            on_delete,
        ])
    } else {
        let violated = format!("NOT ({})", predicate_sql(check_of(change)?, &format!("NEW.{column}")));
        let guard = raise("check", change);
        Ok(vec![
            format!(
                "CREATE TRIGGER {} BEFORE INSERT ON {table} FOR EACH ROW WHEN {violated} BEGIN {guard}; END",
                quote_ident(&names[0])
            ),
            format!(
                "CREATE TRIGGER {} BEFORE UPDATE OF {column} ON {table} FOR EACH ROW WHEN {violated} BEGIN {guard}; END",
                quote_ident(&names[1])
            ),
        ])
    }
}

async fn key_column(conn: &mut SqliteConnection, table: &str) -> Result<String, ConstraintError> {
    let pk: Option<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?1) WHERE pk = 1")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(pk.map(|name| quote_ident(&name)).unwrap_or_else(|| "rowid".to_string()))
}

async fn validate_on(
    conn: &mut SqliteConnection,
    change: &ConstraintChange,
) -> Result<OrphanReport, ConstraintError> {
    let empty = |checked_rows| OrphanReport {
        change: change.clone(),
        checked_rows,
        orphan_count: 0,
        orphans: Vec::new(),
    };
    if !change.kind.is_add() {
        return Ok(empty(0));
    }

    let table = quote_ident(&change.table);
    let column = quote_ident(&change.column);
    let key = key_column(conn, &change.table).await?;
    let (from, violating, checked) = match change.kind {
        ConstraintKind::AddFk => {
            let parent = parent_of(change)?;
            (
                format!(
                    "{table} c LEFT JOIN {} p ON p.{} = c.{column}",
                    quote_ident(&parent.table),
                    quote_ident(&parent.column)
                ),
                format!("c.{column} IS NOT NULL AND p.{} IS NULL", quote_ident(&parent.column)),
                format!("SELECT COUNT(*) FROM {table} WHERE {column} IS NOT NULL"),
            )
        }
        _ => (
            format!("{table} c"),
            format!("NOT ({})", predicate_sql(check_of(change)?, &format!("c.{column}"))),
            format!("SELECT COUNT(*) FROM {table}"),
        ),
    };

    let checked_rows: i64 = sqlx::query_scalar(&checked).fetch_one(&mut *conn).await?;
    let orphan_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {from} WHERE {violating}"))
        .fetch_one(&mut *conn)
        .await?;
    if orphan_count == 0 {
        return Ok(empty(checked_rows.max(0) as u64));
    }

    let rows = sqlx::query(&format!(
        "SELECT c.{key}, c.{column} FROM {from} WHERE {violating} ORDER BY c.{key} LIMIT {ORPHAN_SAMPLE_LIMIT}"
    ))
    .fetch_all(&mut *conn)
    .await?;
    let orphans = rows
        .iter()
        .map(|row| -> Result<Orphan, sqlx::Error> {
            Ok(Orphan {
                key: decode_column(row, 0)?,
                value: decode_column(row, 1)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OrphanReport {
        change: change.clone(),
        checked_rows: checked_rows.max(0) as u64,
        orphan_count: orphan_count as u64,
        orphans,
    })
}

/// Rows that would violate `change` if it were applied now.
pub async fn validate(pool: &SqlitePool, change: &ConstraintChange) -> Result<OrphanReport, ConstraintError> {
    let mut conn = pool.acquire().await?;
    validate_on(&mut conn, change).await
}

/// Create the enforcement triggers, then re-validate inside the same write
/// transaction. Any violation rolls the triggers back. Drop changes remove
/// the triggers instead. Returns the trigger names now in force.
pub async fn apply(pool: &SqlitePool, change: &ConstraintChange) -> Result<Vec<String>, ConstraintError> {
    if !change.kind.is_add() {
        remove(pool, change).await?;
        return Ok(Vec::new());
    }

    let statements = trigger_sql(change)?;
    let names = trigger_names(change);
    let mut tx = pool.begin().await?;
    for name in &names {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))
            .execute(&mut *tx)
            .await?;
    }
    for sql in &statements {
        sqlx::query(sql).execute(&mut *tx).await?;
    }
    let report = validate_on(&mut tx, change).await?;
    if !report.is_clean() {
        tx.rollback().await?;
        info!(
            target: "tableshift",
            event = "constraint_rejected",
            constraint = %change.label(),
            orphan_count = report.orphan_count
        );
        return Err(ConstraintError::Violations { report });
    }
    tx.commit().await?;
    info!(
        target: "tableshift",
        event = "constraint_applied",
        constraint = %change.label(),
        checked_rows = report.checked_rows,
        triggers = names.len()
    );
    Ok(names)
}

/// Drop every trigger `change` would own. Missing triggers are ignored.
pub async fn remove(pool: &SqlitePool, change: &ConstraintChange) -> Result<(), ConstraintError> {
    let names = trigger_names(change);
    db::run_in_tx(pool, move |tx| {
        Box::pin(async move {
            for name in &names {
                sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))
                    .execute(&mut **tx)
                    .await?;
            }
            Ok::<(), ConstraintError>(())
        })
    })
    .await?;
    info!(target: "tableshift", event = "constraint_removed", constraint = %change.label());
    Ok(())
}
