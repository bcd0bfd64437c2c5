//! Staged driver for one migration: `Planned -> Backfilling -> Validating ->
//! ConstraintsApplied -> Verified -> Active`, with `Failed` and `RolledBack`
//! off to the side.
//!
//! Every step persists its state change before the next one starts, so a
//! driver that stops for any reason can be resumed from the stored state.
//! Fatal errors move the migration to `Failed`; blocking errors (integrity or
//! constraint problems) are recorded and leave it where it is so an operator
//! can fix the data and resume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backfill::{
    delete_target_rows, derive_row, fetch_source_row, target_row_exists, upsert_rows,
    BackfillControl, BackfillCursor, BackfillExecutor, BatchObserver, MirrorGate,
};
use crate::config::EngineConfig;
use crate::constraints::{self, constraint_name, is_trigger_violation, ConstraintError, OrphanReport};
use crate::derive::DerivationError;
use crate::error::codes;
use crate::plan::MigrationPlan;
use crate::router::{ActiveTableRouter, RouterRegistry};
use crate::schema::{ensure_table, introspect, SchemaError};
use crate::state::{MigrationState, RunRegistry};
use crate::store::{MetadataStore, StateChange};
use crate::value::Value;
use crate::verify::{self, VerificationReport};
use crate::{db, AppError, AppResult};

/// What a mirrored write did to the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MirrorOutcome {
    /// Target row written from the re-derived source row.
    Applied,
    /// Source row is gone; any target row was removed.
    Deleted,
    /// Re-derivation failed; the key is quarantined.
    Quarantined { column: String, error: DerivationError },
    /// Key is ahead of the backfill cursor; the committing batch picks it up.
    Deferred,
    /// The migration is not in a phase that owns the target table.
    Skipped { state: MigrationState },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: u64,
    pub recovered: u64,
    pub still_failing: u64,
}

/// Everything an operator needs to see about one migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub id: Uuid,
    pub state: MigrationState,
    pub source_table: String,
    pub target_table: String,
    pub logical_name: String,
    pub active_table: Option<String>,
    pub generation: Option<u64>,
    pub cursor: BackfillCursor,
    pub quarantined: u64,
    pub verification_attempt: Option<u32>,
    pub verification: Option<VerificationReport>,
    pub constraints: Vec<String>,
    pub error: Option<AppError>,
    pub history: Vec<StateChange>,
    pub running: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    data: SqlitePool,
    store: MetadataStore,
    config: EngineConfig,
    routers: RouterRegistry,
    runs: RunRegistry,
    gates: Arc<Mutex<HashMap<Uuid, Arc<MirrorGate>>>>,
    observer: Option<BatchObserver>,
    control: BackfillControl,
}

fn phase_of(state: MigrationState) -> &'static str {
    match state {
        MigrationState::Planned => "prepare",
        MigrationState::Backfilling => "backfill",
        MigrationState::Validating => "validate",
        MigrationState::ConstraintsApplied => "final_verify",
        MigrationState::Verified => "activate",
        MigrationState::Active | MigrationState::RolledBack => "rollback",
        MigrationState::Failed => "failed",
    }
}

fn integrity_error(report: &VerificationReport) -> AppError {
    let keys: Vec<String> = report
        .sampled_mismatches()
        .iter()
        .take(20)
        .map(|m| format!("{}:{}", m.key, m.field))
        .collect();
    AppError::new(codes::INTEGRITY_MISMATCH, "Target does not match source.")
        .with_context("source_count", report.source_count().to_string())
        .with_context("target_count", report.target_count().to_string())
        .with_context("checksum_match", report.checksum_match().to_string())
        .with_context("mismatches", report.sampled_mismatches().len().to_string())
        .with_context("mismatch_keys", keys.join(","))
        .with_context("quarantined", report.quarantined().to_string())
}

impl Orchestrator {
    /// Open both databases named by `config`.
    pub async fn open(config: EngineConfig) -> AppResult<Self> {
        config.validate()?;
        let data = db::open_sqlite_pool(&config.data_db, config.workers as u32 + 2).await?;
        let store = MetadataStore::open(&config.metadata_db).await?;
        Ok(Self::new(data, store, config))
    }

    pub fn new(data: SqlitePool, store: MetadataStore, config: EngineConfig) -> Self {
        Self {
            data,
            store,
            config,
            routers: RouterRegistry::new(),
            runs: RunRegistry::new(),
            gates: Arc::new(Mutex::new(HashMap::new())),
            observer: None,
            control: BackfillControl::new(),
        }
    }

    pub fn with_observer(mut self, observer: BatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn control(&self) -> BackfillControl {
        self.control.clone()
    }

    pub fn data_pool(&self) -> &SqlitePool {
        &self.data
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn gate_for(&self, id: Uuid) -> Arc<MirrorGate> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates.entry(id).or_insert_with(|| Arc::new(MirrorGate::new())).clone()
    }

    /// Validate `plan` against the live source and register it in `Planned`.
    pub async fn prepare(&self, plan: MigrationPlan) -> AppResult<Uuid> {
        plan.validate()?;
        let source = introspect(&self.data, &plan.source.table)
            .await?
            .ok_or_else(|| SchemaError::MissingTable(plan.source.table.clone()))?;
        plan.validate_against_source(&source)?;
        let id = Uuid::now_v7();
        self.store.create_migration(id, &plan).await?;
        Ok(id)
    }

    /// Register `plan` and drive it to `Active`.
    pub async fn start_migration(&self, plan: MigrationPlan) -> AppResult<Uuid> {
        let id = self.prepare(plan).await?;
        self.resume(id).await?;
        Ok(id)
    }

    /// Drive a stored migration forward from its persisted state.
    pub async fn resume(&self, id: Uuid) -> AppResult<MigrationState> {
        let _guard = self.runs.begin(id)?;
        let record = self.store.load_migration(id).await?;
        match record.state {
            MigrationState::Active | MigrationState::RolledBack => return Ok(record.state),
            MigrationState::Failed => {
                let cause = record.error.unwrap_or_else(|| {
                    AppError::new(codes::ILLEGAL_TRANSITION, "Migration failed.")
                });
                return Err(AppError::new(
                    codes::ILLEGAL_TRANSITION,
                    "Failed migrations can only be rolled back.",
                )
                .with_context("migration_id", id.to_string())
                .with_context("state", MigrationState::Failed.as_str())
                .with_cause(cause));
            }
            _ => {}
        }
        if record.error.is_some() {
            self.store.record_error(id, None).await?;
        }

        let plan = Arc::new(record.plan);
        let mut state = record.state;
        info!(target: "tableshift", event = "migration_resumed", migration_id = %id, state = %state);
        while state != MigrationState::Active {
            state = match self.step(id, &plan, state).await {
                Ok(next) => next,
                Err(err) => return Err(self.settle(id, state, err).await),
            };
        }
        Ok(state)
    }

    /// Attach migration context to `err` and persist it according to its
    /// severity.
    async fn settle(&self, id: Uuid, state: MigrationState, err: AppError) -> AppError {
        let err = err
            .with_context("migration_id", id.to_string())
            .with_context("state", state.as_str())
            .with_context("phase", phase_of(state));
        if err.is_fatal() {
            error!(target: "tableshift", event = "migration_failed", migration_id = %id, state = %state, code = %err.code(), error = %err);
            if let Err(store_err) = self.store.mark_failed(id, state, &err).await {
                error!(target: "tableshift", event = "migration_fail_record_error", migration_id = %id, error = %store_err);
            }
        } else if err.is_blocking() {
            warn!(target: "tableshift", event = "migration_blocked", migration_id = %id, state = %state, code = %err.code(), error = %err);
            if let Err(store_err) = self.store.record_error(id, Some(&err)).await {
                error!(target: "tableshift", event = "migration_block_record_error", migration_id = %id, error = %store_err);
            }
        } else {
            warn!(target: "tableshift", event = "migration_interrupted", migration_id = %id, state = %state, code = %err.code(), error = %err);
        }
        err
    }

    async fn step(&self, id: Uuid, plan: &Arc<MigrationPlan>, state: MigrationState) -> AppResult<MigrationState> {
        match state {
            MigrationState::Planned => {
                let source = introspect(&self.data, &plan.source.table)
                    .await?
                    .ok_or_else(|| SchemaError::MissingTable(plan.source.table.clone()))?;
                plan.validate_against_source(&source)?;
                ensure_table(&self.data, &plan.target).await?;
                self.advance(id, state, MigrationState::Backfilling).await
            }
            MigrationState::Backfilling => {
                let gate = self.gate_for(id);
                BackfillExecutor::new(
                    self.data.clone(),
                    self.store.clone(),
                    Arc::clone(plan),
                    id,
                    &self.config,
                )
                .with_observer(self.observer.clone())
                .with_control(self.control.clone())
                .with_gate(Arc::clone(&gate))
                .run()
                .await?;

                // Keys parked after the last batch committed are applied
                // directly before the phase ends.
                let mut pending = gate.lock().await;
                for key in pending.take_all() {
                    self.apply_mirror(id, plan, &key).await?;
                }
                let next = self.advance(id, state, MigrationState::Validating).await;
                drop(pending);
                next
            }
            MigrationState::Validating => {
                let report = self.run_verification(id, plan).await?;
                if !report.passed() {
                    return Err(integrity_error(&report));
                }
                for change in plan.added_constraints() {
                    let report = constraints::validate(&self.data, change).await?;
                    if !report.is_clean() {
                        return Err(ConstraintError::Violations { report }.into());
                    }
                }
                for change in &plan.constraints {
                    constraints::apply(&self.data, change).await?;
                    if change.kind.is_add() {
                        self.store
                            .record_constraint(id, &constraint_name(change), change)
                            .await?;
                    }
                }
                self.advance(id, state, MigrationState::ConstraintsApplied).await
            }
            MigrationState::ConstraintsApplied => {
                let report = self.run_verification(id, plan).await?;
                if !report.passed() {
                    return Err(integrity_error(&report));
                }
                self.store
                    .archive_and_transition(id, state, MigrationState::Verified)
                    .await?;
                Ok(MigrationState::Verified)
            }
            MigrationState::Verified => {
                let logical = plan.logical_name();
                let router = self.router(logical).await?;
                let generation = self
                    .store
                    .swap_designation(
                        id,
                        state,
                        MigrationState::Active,
                        logical,
                        &plan.source.table,
                        &plan.target.name,
                    )
                    .await?;
                self.flip(&router, &plan.source.table, &plan.target.name, generation);
                info!(target: "tableshift", event = "migration_activated", migration_id = %id, logical_name = %logical, table = %plan.target.name, generation);
                Ok(MigrationState::Active)
            }
            other => Err(AppError::new(
                codes::ILLEGAL_TRANSITION,
                format!("nothing to drive from {other}"),
            )),
        }
    }

    async fn advance(&self, id: Uuid, from: MigrationState, to: MigrationState) -> AppResult<MigrationState> {
        self.store.transition(id, from, to).await?;
        Ok(to)
    }

    /// Swap the in-memory designation after the persisted one moved.
    fn flip(&self, router: &ActiveTableRouter, from: &str, to: &str, generation: u64) {
        if router.compare_and_swap(from, to).is_err() || router.designation().generation != generation {
            router.advance_to(to, generation);
        }
    }

    async fn run_verification(&self, id: Uuid, plan: &MigrationPlan) -> AppResult<VerificationReport> {
        let quarantined = self.store.quarantined_keys(id).await?;
        let report = self
            .config
            .verify_retry()
            .run("verify", codes::BATCH_TIMEOUT, |_| {
                verify::verify(&self.data, plan, id, &quarantined, &self.config.sample)
            })
            .await?;
        let attempt = self.store.save_report(&report).await?;
        info!(target: "tableshift", event = "verification_recorded", migration_id = %id, attempt, passed = report.passed());
        Ok(report)
    }

    pub async fn status(&self, id: Uuid) -> AppResult<MigrationState> {
        Ok(self.store.load_migration(id).await?.state)
    }

    pub async fn describe(&self, id: Uuid) -> AppResult<MigrationStatus> {
        let record = self.store.load_migration(id).await?;
        let designation = self.store.designation(&record.logical_name).await?;
        let latest = self.store.latest_report(id).await?;
        let (verification_attempt, verification) = match latest {
            Some((attempt, report)) => (Some(attempt), Some(report)),
            None => (None, None),
        };
        Ok(MigrationStatus {
            id,
            state: record.state,
            active_table: designation.as_ref().map(|(table, _)| table.clone()),
            generation: designation.map(|(_, generation)| generation),
            cursor: self.store.load_cursor(id).await?,
            quarantined: self.store.quarantined(id).await?.len() as u64,
            verification_attempt,
            verification,
            constraints: self
                .store
                .applied_constraints(id)
                .await?
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            history: self.store.history(id).await?,
            running: self.runs.is_running(id),
            source_table: record.source_table,
            target_table: record.target_table,
            logical_name: record.logical_name,
            error: record.error,
        })
    }

    /// Run and persist a verification pass without changing state.
    pub async fn verify(&self, id: Uuid) -> AppResult<VerificationReport> {
        let record = self.store.load_migration(id).await?;
        self.run_verification(id, &record.plan)
            .await
            .map_err(|err| err.with_context("migration_id", id.to_string()))
    }

    /// Orphan reports for every constraint the plan adds.
    pub async fn validate_constraints(&self, id: Uuid) -> AppResult<Vec<OrphanReport>> {
        let record = self.store.load_migration(id).await?;
        let mut reports = Vec::new();
        for change in record.plan.added_constraints() {
            reports.push(constraints::validate(&self.data, change).await?);
        }
        Ok(reports)
    }

    /// Undo a failed or activated migration: drop the triggers it added and,
    /// when active, point the router back at the source. Target rows stay.
    pub async fn rollback(&self, id: Uuid) -> AppResult<MigrationState> {
        let _guard = self.runs.begin(id)?;
        let record = self.store.load_migration(id).await?;
        record
            .state
            .transition(MigrationState::RolledBack)
            .map_err(|err| AppError::from(err).with_context("migration_id", id.to_string()))?;

        for (name, change) in self.store.applied_constraints(id).await? {
            constraints::remove(&self.data, &change).await?;
            self.store.forget_constraint(id, &name).await?;
        }

        let plan = &record.plan;
        if record.state == MigrationState::Active {
            let logical = plan.logical_name();
            let router = self.router(logical).await?;
            let generation = self
                .store
                .swap_designation(
                    id,
                    MigrationState::Active,
                    MigrationState::RolledBack,
                    logical,
                    &plan.target.name,
                    &plan.source.table,
                )
                .await?;
            self.flip(&router, &plan.target.name, &plan.source.table, generation);
        } else {
            self.store
                .transition(id, record.state, MigrationState::RolledBack)
                .await?;
        }
        info!(target: "tableshift", event = "migration_rolled_back", migration_id = %id, from = %record.state);
        Ok(MigrationState::RolledBack)
    }

    /// Re-derive `key` after the caller changed the source row, so the target
    /// never misses a write made while the migration is in flight.
    pub async fn mirror_write(&self, id: Uuid, key: Value) -> AppResult<MirrorOutcome> {
        let gate = self.gate_for(id);
        let mut pending = gate.lock().await;
        let record = self.store.load_migration(id).await?;
        match record.state {
            MigrationState::Backfilling => {
                let cursor = self.store.load_cursor(id).await?;
                if !cursor.covers(&key) {
                    pending.defer(key);
                    return Ok(MirrorOutcome::Deferred);
                }
            }
            MigrationState::Validating
            | MigrationState::ConstraintsApplied
            | MigrationState::Verified => {}
            state => return Ok(MirrorOutcome::Skipped { state }),
        }
        let outcome = self
            .apply_mirror(id, &record.plan, &key)
            .await
            .map_err(|err| {
                err.with_context("migration_id", id.to_string())
                    .with_context("key", key.to_string())
            });
        drop(pending);
        outcome
    }

    async fn apply_mirror(&self, id: Uuid, plan: &MigrationPlan, key: &Value) -> AppResult<MirrorOutcome> {
        let existed = target_row_exists(&self.data, plan, key).await?;
        let source = fetch_source_row(&self.data, plan, key).await?;
        let mut conn = self.data.acquire().await?;
        let (outcome, quarantine, delta) = match source.as_ref().map(|row| derive_row(plan, row)) {
            Some(Ok(row)) => {
                upsert_rows(&mut conn, plan, std::slice::from_ref(&row))
                    .await
                    .map_err(|err| {
                        if is_trigger_violation(&err) {
                            AppError::new(codes::CONSTRAINT_VIOLATION, err.message().to_string())
                        } else {
                            err
                        }
                    })?;
                (MirrorOutcome::Applied, None, i64::from(!existed))
            }
            Some(Err(failure)) => {
                if existed {
                    delete_target_rows(&mut conn, plan, std::slice::from_ref(key)).await?;
                }
                warn!(
                    target: "tableshift",
                    event = "backfill_row_quarantined",
                    migration_id = %id,
                    key = %key,
                    column = %failure.column,
                    error = %failure.error
                );
                (
                    MirrorOutcome::Quarantined {
                        column: failure.column.clone(),
                        error: failure.error.clone(),
                    },
                    Some(failure),
                    -i64::from(existed),
                )
            }
            None => {
                if existed {
                    delete_target_rows(&mut conn, plan, std::slice::from_ref(key)).await?;
                }
                (MirrorOutcome::Deleted, None, -i64::from(existed))
            }
        };
        drop(conn);
        self.store
            .reconcile_row(id, key, quarantine.as_ref(), delta)
            .await?;
        info!(target: "tableshift", event = "mirror_applied", migration_id = %id, key = %key, outcome = ?outcome);
        Ok(outcome)
    }

    /// Re-derive every quarantined row; rows that now derive cleanly are
    /// written and released from quarantine.
    pub async fn retry_failed_rows(&self, id: Uuid) -> AppResult<RetrySummary> {
        let gate = self.gate_for(id);
        let _pending = gate.lock().await;
        let record = self.store.load_migration(id).await?;
        if !matches!(
            record.state,
            MigrationState::Backfilling
                | MigrationState::Validating
                | MigrationState::ConstraintsApplied
                | MigrationState::Verified
        ) {
            return Err(AppError::new(
                codes::ILLEGAL_TRANSITION,
                format!("cannot retry rows of a migration in {}", record.state),
            )
            .with_context("migration_id", id.to_string()));
        }

        let mut summary = RetrySummary::default();
        for row in self.store.quarantined(id).await? {
            summary.attempted += 1;
            match self.apply_mirror(id, &record.plan, &row.key).await? {
                MirrorOutcome::Quarantined { .. } => summary.still_failing += 1,
                _ => summary.recovered += 1,
            }
        }
        info!(
            target: "tableshift",
            event = "quarantine_retried",
            migration_id = %id,
            attempted = summary.attempted,
            recovered = summary.recovered,
            still_failing = summary.still_failing
        );
        Ok(summary)
    }

    /// Router for `logical_name`, synced with the persisted designation.
    /// Names that were never migrated route to the table of the same name.
    pub async fn router(&self, logical_name: &str) -> AppResult<Arc<ActiveTableRouter>> {
        match self.store.designation(logical_name).await? {
            Some((table, generation)) => {
                let router = self.routers.get_or_insert(logical_name, &table, generation);
                router.advance_to(&table, generation);
                Ok(router)
            }
            None => Ok(self.routers.get_or_insert(logical_name, logical_name, 0)),
        }
    }
}
