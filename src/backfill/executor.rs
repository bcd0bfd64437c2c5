use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use super::batch::{commit_target, log_commit};
use super::{
    derive_row, fetch_source_row, next_boundary, read_range, BackfillControl, BackfillCursor,
    BackfillPhase, BatchObserver, BatchRange, BatchStats, DerivedBatch, MirrorGate,
};
use crate::config::EngineConfig;
use crate::error::codes;
use crate::plan::MigrationPlan;
use crate::retry::RetryPolicy;
use crate::store::MetadataStore;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSummary {
    pub migration_id: Uuid,
    /// Batches committed by this run.
    pub batches: u64,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub cursor: BackfillCursor,
}

/// Drives a migration's backfill from its persisted cursor to the end of the
/// source table.
pub struct BackfillExecutor {
    data: SqlitePool,
    store: MetadataStore,
    plan: Arc<MigrationPlan>,
    migration_id: Uuid,
    workers: usize,
    retry: RetryPolicy,
    max_failed_rows: u64,
    observer: Option<BatchObserver>,
    control: BackfillControl,
    gate: Arc<MirrorGate>,
}

impl BackfillExecutor {
    pub fn new(
        data: SqlitePool,
        store: MetadataStore,
        plan: Arc<MigrationPlan>,
        migration_id: Uuid,
        config: &EngineConfig,
    ) -> Self {
        Self {
            data,
            store,
            plan,
            migration_id,
            workers: config.workers.max(1),
            retry: config.batch_retry(),
            max_failed_rows: config.max_failed_rows,
            observer: None,
            control: BackfillControl::new(),
            gate: Arc::new(MirrorGate::new()),
        }
    }

    pub fn with_observer(mut self, observer: Option<BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_control(mut self, control: BackfillControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_gate(mut self, gate: Arc<MirrorGate>) -> Self {
        self.gate = gate;
        self
    }

    pub async fn run(&self) -> AppResult<BackfillSummary> {
        let mut cursor = self.store.load_cursor(self.migration_id).await?;
        self.store
            .set_cursor_phase(self.migration_id, BackfillPhase::Running)
            .await?;
        info!(
            target: "tableshift",
            event = "backfill_started",
            migration_id = %self.migration_id,
            workers = self.workers,
            batch_size = self.plan.batch_size,
            resume_from = %cursor.last_processed_key.as_ref().map(|key| key.to_string()).unwrap_or_default()
        );

        let mut frontier = cursor.last_processed_key.clone();
        let mut next_sequence = 0u64;
        let mut next_commit = 0u64;
        let mut batches = 0u64;
        let mut in_flight: JoinSet<AppResult<DerivedBatch>> = JoinSet::new();
        let mut parked: BTreeMap<u64, DerivedBatch> = BTreeMap::new();
        let mut source_done = false;

        loop {
            while !source_done
                && !self.control.is_cancelled()
                && in_flight.len() + parked.len() < self.workers
            {
                match next_boundary(&self.data, &self.plan, frontier.as_ref()).await? {
                    Some(through) => {
                        let range = BatchRange {
                            sequence: next_sequence,
                            after: frontier.replace(through.clone()),
                            through,
                        };
                        next_sequence += 1;
                        self.spawn_worker(&mut in_flight, range);
                    }
                    None => source_done = true,
                }
            }

            if in_flight.is_empty() && parked.is_empty() {
                if self.control.is_cancelled() {
                    info!(target: "tableshift", event = "backfill_cancelled", migration_id = %self.migration_id, batch = cursor.batches_committed);
                    return Err(AppError::new(codes::CANCELLED, "backfill cancelled")
                        .with_context("migration_id", self.migration_id.to_string())
                        .with_context("batches_committed", cursor.batches_committed.to_string()));
                }
                // Rows may have landed past the frontier while the last batches
                // were committing.
                if next_boundary(&self.data, &self.plan, frontier.as_ref())
                    .await?
                    .is_some()
                {
                    debug!(target: "tableshift", event = "backfill_catch_up", migration_id = %self.migration_id);
                    source_done = false;
                    continue;
                }
                break;
            }

            if let Some(joined) = in_flight.join_next().await {
                let batch = joined.map_err(|err| {
                    AppError::new(codes::WORKER_FAILED, format!("backfill worker failed: {err}"))
                        .with_context("migration_id", self.migration_id.to_string())
                })??;
                parked.insert(batch.range.sequence, batch);
            }

            while let Some(batch) = parked.remove(&next_commit) {
                cursor = self.commit(batch).await?;
                next_commit += 1;
                batches += 1;
                if let Some(observer) = &self.observer {
                    observer(&BatchStats {
                        migration_id: self.migration_id,
                        batch_index: cursor.batches_committed,
                        rows_processed: cursor.rows_processed,
                        rows_failed: cursor.rows_failed,
                        last_key: cursor.last_processed_key.clone(),
                    });
                }
                if cursor.rows_failed > self.max_failed_rows {
                    return Err(AppError::new(
                        codes::FAILURE_THRESHOLD,
                        format!(
                            "{} rows quarantined, limit is {}",
                            cursor.rows_failed, self.max_failed_rows
                        ),
                    )
                    .with_context("migration_id", self.migration_id.to_string())
                    .with_context("rows_failed", cursor.rows_failed.to_string()));
                }
            }
        }

        self.store
            .set_cursor_phase(self.migration_id, BackfillPhase::Exhausted)
            .await?;
        cursor.phase = BackfillPhase::Exhausted;
        info!(
            target: "tableshift",
            event = "backfill_exhausted",
            migration_id = %self.migration_id,
            batches,
            rows_processed = cursor.rows_processed,
            rows_failed = cursor.rows_failed
        );
        Ok(BackfillSummary {
            migration_id: self.migration_id,
            batches,
            rows_processed: cursor.rows_processed,
            rows_failed: cursor.rows_failed,
            cursor,
        })
    }

    fn spawn_worker(&self, set: &mut JoinSet<AppResult<DerivedBatch>>, range: BatchRange) {
        let data = self.data.clone();
        let plan = Arc::clone(&self.plan);
        let retry = self.retry;
        set.spawn(async move {
            let source = retry
                .run("backfill_read", codes::BATCH_TIMEOUT, |_| {
                    read_range(&data, &plan, range.after.as_ref(), Some(&range.through), None)
                })
                .await?;
            Ok(DerivedBatch::derive(&plan, range, source))
        });
    }

    /// Write one batch and its checkpoint while holding the mirror gate.
    async fn commit(&self, mut batch: DerivedBatch) -> AppResult<BackfillCursor> {
        let mut pending = self.gate.lock().await;
        let mut vanished = Vec::new();
        for key in pending.take_in_range(&batch.range) {
            batch.forget(&key);
            match fetch_source_row(&self.data, &self.plan, &key).await? {
                Some(row) => match derive_row(&self.plan, &row) {
                    Ok(target) => batch.rows.push(target),
                    Err(failure) => batch.failures.push(failure),
                },
                None => vanished.push(key),
            }
        }
        let mut remove = batch.failed_keys();
        remove.extend(vanished);

        let written = self
            .retry
            .run("backfill_commit", codes::BATCH_TIMEOUT, |_| {
                commit_target(&self.data, &self.plan, &batch.rows, &remove)
            })
            .await?;
        let cursor = self
            .retry
            .run("backfill_checkpoint", codes::BATCH_TIMEOUT, |_| {
                self.store.commit_checkpoint(
                    self.migration_id,
                    batch.range.after.as_ref(),
                    &batch.range.through,
                    written,
                    &batch.failures,
                )
            })
            .await?;
        drop(pending);

        log_commit(self.migration_id, &cursor, written, batch.failures.len() as u64);
        Ok(cursor)
    }
}
