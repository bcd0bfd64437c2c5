use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tableshift::{
    config::EngineConfig, logging::init_logging, time::iso_from_ms, AppError, MigrationPlan,
    Orchestrator, Value,
};
use tokio::signal;
use tracing::info;
use uuid::Uuid;

const EXIT_ERROR: i32 = 1;
const EXIT_BLOCKED: i32 = 2;
const EXIT_FAILED: i32 = 3;

#[derive(Parser)]
#[command(name = "tableshift", about = "Online table migration and backfill")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON engine configuration.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH", global = true)]
    data_db: Option<PathBuf>,

    #[arg(long, value_name = "PATH", global = true)]
    metadata_db: Option<PathBuf>,

    #[arg(long, value_name = "PATH", global = true)]
    log_dir: Option<PathBuf>,

    /// Print machine readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Register a plan and drive it to activation")]
    Start {
        #[arg(long, value_name = "PATH")]
        plan: PathBuf,
    },
    #[command(about = "Continue a migration from its persisted state")]
    Resume { id: Uuid },
    #[command(about = "Show one migration, or list them all")]
    Status { id: Option<Uuid> },
    #[command(about = "Run and record a verification pass")]
    Verify { id: Uuid },
    #[command(about = "Report rows that would violate the plan's constraints")]
    ValidateConstraints { id: Uuid },
    #[command(about = "Roll back a failed or active migration")]
    Rollback { id: Uuid },
    #[command(about = "Re-derive quarantined rows")]
    RetryFailed { id: Uuid },
    #[command(about = "Re-derive one source key after a write")]
    Mirror {
        id: Uuid,
        /// Key as JSON (`42`, `"abc"`); bare text is taken as a string.
        #[arg(long)]
        key: String,
    },
    #[command(about = "Show the table currently designated for a logical name")]
    Active { logical_name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    let _log_guard = init_logging(config.log_dir.as_deref());

    let orchestrator = Orchestrator::open(config)
        .await
        .map_err(|err| anyhow!(format_cli_error(&err)))?;

    if let Err(CliError { error, reported }) = run(cli.command, cli.global.json, &orchestrator).await {
        eprintln!("error: {}", format_cli_error(&error));
        // Stdout carries a single JSON document: the report when one was
        // printed, otherwise the error itself.
        if cli.global.json && !reported {
            if let Ok(body) = serde_json::to_string_pretty(&error) {
                println!("{body}");
            }
        }
        std::process::exit(exit_code(&error));
    }
    Ok(())
}

/// A command failure, and whether its report already went to stdout.
struct CliError {
    error: AppError,
    reported: bool,
}

impl CliError {
    fn after_report(error: AppError) -> Self {
        Self {
            error,
            reported: true,
        }
    }
}

impl From<AppError> for CliError {
    fn from(error: AppError) -> Self {
        Self {
            error,
            reported: false,
        }
    }
}

fn load_config(args: &GlobalArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(args.config.as_deref())
        .map_err(|err| anyhow!(format_cli_error(&err)))
        .context("load configuration")?;
    if let Some(path) = &args.data_db {
        config.data_db = path.clone();
    }
    if let Some(path) = &args.metadata_db {
        config.metadata_db = path.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = Some(dir.clone());
    }
    config
        .validate()
        .map_err(|err| anyhow!(format_cli_error(&err)))?;
    Ok(config)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<(), AppError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

async fn run(command: Command, json: bool, orchestrator: &Orchestrator) -> Result<(), CliError> {
    match command {
        Command::Start { plan } => {
            let plan = MigrationPlan::load(&plan)?;
            let id = orchestrator.prepare(plan).await?;
            eprintln!("migration {id} registered");
            drive(orchestrator, id).await?;
            let status = orchestrator.describe(id).await?;
            emit(json, &status, |s| println!("migration {} is {}", s.id, s.state))?;
            Ok(())
        }
        Command::Resume { id } => {
            drive(orchestrator, id).await?;
            let status = orchestrator.describe(id).await?;
            emit(json, &status, |s| println!("migration {} is {}", s.id, s.state))?;
            Ok(())
        }
        Command::Status { id: Some(id) } => {
            let status = orchestrator.describe(id).await?;
            emit(json, &status, |s| {
                println!("migration {} ({} -> {})", s.id, s.source_table, s.target_table);
                println!("  state:        {}", s.state);
                println!(
                    "  backfill:     {} processed, {} failed, {} batches ({})",
                    s.cursor.rows_processed,
                    s.cursor.rows_failed,
                    s.cursor.batches_committed,
                    s.cursor.phase.as_str()
                );
                if let Some(table) = &s.active_table {
                    println!("  active table: {table} (generation {})", s.generation.unwrap_or(0));
                }
                if let Some(report) = &s.verification {
                    println!(
                        "  verification: {} at {} ({} source, {} target, {} mismatches)",
                        if report.passed() { "passed" } else { "failed" },
                        iso_from_ms(report.generated_at()),
                        report.source_count(),
                        report.target_count(),
                        report.sampled_mismatches().len()
                    );
                }
                if let Some(err) = &s.error {
                    println!("  error:        {}", format_cli_error(err));
                }
                println!("  history:");
                for change in &s.history {
                    let from = change.from.map(|state| state.to_string()).unwrap_or_else(|| "-".into());
                    println!("    {}  {from} -> {}", iso_from_ms(change.at), change.to);
                }
            })?;
            Ok(())
        }
        Command::Status { id: None } => {
            let all: Vec<(String, String)> = orchestrator
                .store()
                .list_migrations()
                .await?
                .into_iter()
                .map(|(id, state)| (id.to_string(), state.to_string()))
                .collect();
            emit(json, &all, |rows| {
                for (id, state) in rows {
                    println!("{id}  {state}");
                }
            })?;
            Ok(())
        }
        Command::Verify { id } => {
            let report = orchestrator.verify(id).await?;
            emit(json, &report, |r| {
                println!(
                    "{}: {} source rows, {} target rows, checksum {}, {} of {} sampled rows differ",
                    if r.passed() { "passed" } else { "failed" },
                    r.source_count(),
                    r.target_count(),
                    if r.checksum_match() { "matches" } else { "differs" },
                    r.sampled_mismatches().len(),
                    r.sample_size()
                );
                for m in r.sampled_mismatches() {
                    println!("  {} {}: {} != {}", m.key, m.field, m.source_value, m.target_value);
                }
            })?;
            if report.passed() {
                Ok(())
            } else {
                Err(CliError::after_report(
                    AppError::new(tableshift::codes::INTEGRITY_MISMATCH, "verification failed")
                        .with_context("migration_id", id.to_string()),
                ))
            }
        }
        Command::ValidateConstraints { id } => {
            let reports = orchestrator.validate_constraints(id).await?;
            emit(json, &reports, |reports| {
                for report in reports {
                    println!(
                        "{}: {} rows checked, {} violations",
                        report.change.label(),
                        report.checked_rows,
                        report.orphan_count
                    );
                    for orphan in report.orphans.iter().take(20) {
                        println!("  key {} value {}", orphan.key, orphan.value);
                    }
                }
            })?;
            if reports.iter().all(|r| r.is_clean()) {
                Ok(())
            } else {
                Err(CliError::after_report(
                    AppError::new(
                        tableshift::codes::CONSTRAINT_VIOLATION,
                        "constraint validation found violations",
                    )
                    .with_context("migration_id", id.to_string()),
                ))
            }
        }
        Command::Rollback { id } => {
            let state = orchestrator.rollback(id).await?;
            emit(json, &state, |s| println!("migration {id} is {s}"))?;
            Ok(())
        }
        Command::RetryFailed { id } => {
            let summary = orchestrator.retry_failed_rows(id).await?;
            emit(json, &summary, |s| {
                println!(
                    "{} quarantined rows retried: {} recovered, {} still failing",
                    s.attempted, s.recovered, s.still_failing
                )
            })?;
            Ok(())
        }
        Command::Mirror { id, key } => {
            let key: Value = serde_json::from_str(&key).unwrap_or(Value::Text(key));
            let outcome = orchestrator.mirror_write(id, key).await?;
            emit(json, &outcome, |o| println!("{o:?}"))?;
            Ok(())
        }
        Command::Active { logical_name } => {
            let designation = orchestrator.router(&logical_name).await?.designation();
            emit(json, &*designation, |d| {
                println!("{logical_name} -> {} (generation {})", d.table, d.generation)
            })?;
            Ok(())
        }
    }
}

/// Resume `id`, cancelling cooperatively on Ctrl-C.
async fn drive(orchestrator: &Orchestrator, id: Uuid) -> Result<(), AppError> {
    let control = orchestrator.control();
    let resume = orchestrator.resume(id);
    tokio::pin!(resume);
    let state = loop {
        tokio::select! {
            result = &mut resume => break result?,
            signal = signal::ctrl_c() => {
                if signal.is_ok() && !control.is_cancelled() {
                    eprintln!("Received interrupt. Finishing in-flight batches before exiting…");
                    control.cancel();
                }
            }
        }
    };
    info!(target: "tableshift", event = "cli_drive_finished", migration_id = %id, state = %state);
    Ok(())
}

fn exit_code(err: &AppError) -> i32 {
    let fatal = err.is_fatal() || err.cause().is_some_and(AppError::is_fatal);
    if fatal {
        EXIT_FAILED
    } else if err.is_blocking() {
        EXIT_BLOCKED
    } else {
        EXIT_ERROR
    }
}

fn format_cli_error(err: &AppError) -> String {
    let id = err
        .context()
        .get("migration_id")
        .map(|id| format!(" (migration {id})"))
        .unwrap_or_default();
    match err.code() {
        tableshift::codes::CONSTRAINT_VIOLATION => {
            let keys = err.context().get("orphan_keys").cloned().unwrap_or_default();
            format!("{}{id}. Offending keys: {keys}", err.message())
        }
        tableshift::codes::INTEGRITY_MISMATCH => {
            format!(
                "{}{id}. Run `tableshift verify` for the full report.",
                err.message()
            )
        }
        tableshift::codes::FAILURE_THRESHOLD => format!(
            "{}{id}. Inspect quarantined rows, fix the source, then roll back and start again.",
            err.message()
        ),
        _ => format!("{err}{id}"),
    }
}
