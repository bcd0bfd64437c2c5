//! Post-backfill integrity check: snapshot counts, key-set checksums, and a
//! deterministic re-derivation sample, all read inside one transaction.

use std::collections::{BinaryHeap, HashSet};

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::backfill::derive_row;
use crate::config::SampleConfig;
use crate::derive::predicate::values_equal;
use crate::plan::MigrationPlan;
use crate::schema::quote_ident;
use crate::time::now_ms;
use crate::value::{bind_value, decode_column, decode_row, SourceRow, Value};
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub key: Value,
    pub field: String,
    pub source_value: Value,
    pub target_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    migration_id: Uuid,
    source_count: u64,
    target_count: u64,
    source_checksum: String,
    target_checksum: String,
    checksum_match: bool,
    sample_size: u64,
    quarantined: u64,
    sampled_mismatches: Vec<Mismatch>,
    generated_at: i64,
}

impl VerificationReport {
    pub fn migration_id(&self) -> Uuid {
        self.migration_id
    }

    pub fn source_count(&self) -> u64 {
        self.source_count
    }

    pub fn target_count(&self) -> u64 {
        self.target_count
    }

    pub fn checksum_match(&self) -> bool {
        self.checksum_match
    }

    pub fn source_checksum(&self) -> &str {
        &self.source_checksum
    }

    pub fn target_checksum(&self) -> &str {
        &self.target_checksum
    }

    pub fn sample_size(&self) -> u64 {
        self.sample_size
    }

    /// Source keys skipped because they sit in quarantine.
    pub fn quarantined(&self) -> u64 {
        self.quarantined
    }

    pub fn sampled_mismatches(&self) -> &[Mismatch] {
        &self.sampled_mismatches
    }

    pub fn generated_at(&self) -> i64 {
        self.generated_at
    }

    pub fn passed(&self) -> bool {
        self.source_count == self.target_count
            && self.checksum_match
            && self.sampled_mismatches.is_empty()
    }
}

/// Rank of `key` in the sample order for `seed`. Lower ranks are sampled.
pub fn sample_rank(seed: u64, key: &Value) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(key.canonical().as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Keeps the `limit` keys with the smallest rank seen so far.
struct SampleSelector {
    seed: u64,
    limit: usize,
    heap: BinaryHeap<(u64, String)>,
}

impl SampleSelector {
    fn new(seed: u64, limit: u64) -> Self {
        Self {
            seed,
            limit: limit as usize,
            heap: BinaryHeap::new(),
        }
    }

    fn offer(&mut self, key: &Value) -> AppResult<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let rank = sample_rank(self.seed, key);
        if self.heap.len() < self.limit {
            self.heap.push((rank, serde_json::to_string(key)?));
        } else if self.heap.peek().is_some_and(|(worst, _)| rank < *worst) {
            self.heap.pop();
            self.heap.push((rank, serde_json::to_string(key)?));
        }
        Ok(())
    }

    fn finish(self) -> AppResult<Vec<Value>> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|(_, key)| serde_json::from_str(&key).map_err(Into::into))
            .collect()
    }
}

struct KeyDigest(Sha256);

impl KeyDigest {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn push(&mut self, key: &Value) {
        self.0.update(key.canonical().as_bytes());
        self.0.update([0x1e]);
    }

    fn finish(self) -> String {
        format!("{:x}", self.0.finalize())
    }
}

async fn count(conn: &mut SqliteConnection, table: &str) -> AppResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let n: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
    Ok(n.max(0) as u64)
}

async fn fetch_by_key(
    conn: &mut SqliteConnection,
    table: &str,
    key_column: &str,
    key: &Value,
) -> AppResult<Option<sqlx::sqlite::SqliteRow>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = ?",
        quote_ident(table),
        quote_ident(key_column)
    );
    Ok(bind_value(sqlx::query(&sql), key)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Compare source and target for `plan`. Keys in `quarantined` (canonical
/// encodings) are left out of the sample.
pub async fn verify(
    data: &SqlitePool,
    plan: &MigrationPlan,
    migration_id: Uuid,
    quarantined: &HashSet<String>,
    sample: &SampleConfig,
) -> AppResult<VerificationReport> {
    let mut tx = data.begin().await?;
    let source_count = count(&mut tx, &plan.source.table).await?;
    let target_count = count(&mut tx, &plan.target.name).await?;

    let eligible = source_count.saturating_sub(quarantined.len() as u64);
    let mut selector = SampleSelector::new(sample.seed, sample.size_for(eligible));
    let mut source_digest = KeyDigest::new();
    let mut skipped = 0u64;
    {
        let pk = quote_ident(&plan.source.primary_key);
        let sql = format!("SELECT {pk} FROM {} ORDER BY {pk}", quote_ident(&plan.source.table));
        let mut rows = sqlx::query(&sql).fetch(&mut *tx);
        while let Some(row) = rows.try_next().await? {
            let key = decode_column(&row, 0)?;
            source_digest.push(&key);
            if quarantined.contains(&key.canonical()) {
                skipped += 1;
            } else {
                selector.offer(&key)?;
            }
        }
    }

    let mut target_digest = KeyDigest::new();
    {
        let pk = quote_ident(&plan.target.primary_key);
        let sql = format!("SELECT {pk} FROM {} ORDER BY {pk}", quote_ident(&plan.target.name));
        let mut rows = sqlx::query(&sql).fetch(&mut *tx);
        while let Some(row) = rows.try_next().await? {
            target_digest.push(&decode_column(&row, 0)?);
        }
    }

    let sampled = selector.finish()?;
    let mut mismatches = Vec::new();
    for key in &sampled {
        let Some(source) =
            fetch_by_key(&mut tx, &plan.source.table, &plan.source.primary_key, key).await?
        else {
            continue;
        };
        let source = SourceRow::from_sqlite(&source, &plan.source.primary_key)?;
        let target = match fetch_by_key(&mut tx, &plan.target.name, &plan.target.primary_key, key).await? {
            Some(row) => decode_row(&row)?,
            None => {
                mismatches.push(Mismatch {
                    key: key.clone(),
                    field: plan.target.primary_key.clone(),
                    source_value: key.clone(),
                    target_value: Value::Null,
                });
                continue;
            }
        };
        match derive_row(plan, &source) {
            Ok(expected) => {
                for (mapping, value) in plan.mappings.iter().zip(expected.values) {
                    let actual = target
                        .get(&mapping.target_column)
                        .cloned()
                        .unwrap_or(Value::Null);
                    if !values_equal(&value, &actual) {
                        mismatches.push(Mismatch {
                            key: key.clone(),
                            field: mapping.target_column.clone(),
                            source_value: value,
                            target_value: actual,
                        });
                    }
                }
            }
            Err(failure) => mismatches.push(Mismatch {
                key: key.clone(),
                field: failure.column.clone(),
                source_value: Value::Text(format!("derivation error: {}", failure.error)),
                target_value: target.get(&failure.column).cloned().unwrap_or(Value::Null),
            }),
        }
    }
    tx.commit().await?;

    let source_checksum = source_digest.finish();
    let target_checksum = target_digest.finish();
    let report = VerificationReport {
        migration_id,
        source_count,
        target_count,
        checksum_match: source_checksum == target_checksum,
        source_checksum,
        target_checksum,
        sample_size: sampled.len() as u64,
        quarantined: skipped,
        sampled_mismatches: mismatches,
        generated_at: now_ms(),
    };
    info!(
        target: "tableshift",
        event = "verification_completed",
        migration_id = %migration_id,
        passed = report.passed(),
        source_count,
        target_count,
        checksum_match = report.checksum_match,
        sample_size = report.sample_size,
        mismatches = report.sampled_mismatches.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_keeps_lowest_ranks() {
        let keys: Vec<Value> = (0..500).map(Value::Integer).collect();
        let mut selector = SampleSelector::new(7, 25);
        for key in &keys {
            selector.offer(key).unwrap();
        }
        let picked = selector.finish().unwrap();
        assert_eq!(picked.len(), 25);

        let mut ranked: Vec<(u64, i64)> = (0..500).map(|k| (sample_rank(7, &Value::Integer(k)), k)).collect();
        ranked.sort();
        let expected: Vec<Value> = ranked[..25].iter().map(|(_, k)| Value::Integer(*k)).collect();
        assert_eq!(picked, expected);
    }

    #[test]
    fn sample_depends_on_seed() {
        let key = Value::Integer(42);
        assert_eq!(sample_rank(1, &key), sample_rank(1, &key));
        assert_ne!(sample_rank(1, &key), sample_rank(2, &key));
    }

    #[test]
    fn zero_limit_samples_nothing() {
        let mut selector = SampleSelector::new(1, 0);
        selector.offer(&Value::Integer(1)).unwrap();
        assert!(selector.finish().unwrap().is_empty());
    }

    #[test]
    fn report_passes_only_when_everything_lines_up() {
        let mut report = VerificationReport {
            migration_id: Uuid::now_v7(),
            source_count: 10,
            target_count: 10,
            source_checksum: "a".into(),
            target_checksum: "a".into(),
            checksum_match: true,
            sample_size: 10,
            quarantined: 0,
            sampled_mismatches: Vec::new(),
            generated_at: 0,
        };
        assert!(report.passed());
        report.target_count = 9;
        assert!(!report.passed());
        report.target_count = 10;
        report.sampled_mismatches.push(Mismatch {
            key: Value::Integer(3),
            field: "garage_number".into(),
            source_value: Value::Integer(2),
            target_value: Value::Integer(1),
        });
        assert!(!report.passed());
    }
}
