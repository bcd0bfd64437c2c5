#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value as Json;
use tableshift::db::open_sqlite_pool;

mod util;
use util::*;

fn tableshift(harness: &Harness) -> Result<Command> {
    let mut cmd = Command::cargo_bin("tableshift")?;
    cmd.env_remove("TABLESHIFT_DATA_DB")
        .env_remove("TABLESHIFT_METADATA_DB")
        .env_remove("TABLESHIFT_WORKERS")
        .arg("--data-db")
        .arg(&harness.config.data_db)
        .arg("--metadata-db")
        .arg(&harness.config.metadata_db);
    Ok(cmd)
}

async fn seed_data(path: &Path, rows: i64, orphan: Option<i64>) -> Result<()> {
    let pool = open_sqlite_pool(path, 2).await?;
    seeded(&pool, rows).await;
    if let Some(id) = orphan {
        sqlx::query("UPDATE listings SET host_id = 4242 WHERE id = ?1")
            .bind(id)
            .execute(&pool)
            .await?;
    }
    pool.close().await;
    Ok(())
}

fn write_plan(harness: &Harness) -> Result<std::path::PathBuf> {
    let path = harness.dir.path().join("plan.json");
    std::fs::write(&path, PLAN_JSON)?;
    Ok(path)
}

fn stdout_json(output: &std::process::Output) -> Json {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[tokio::test]
async fn start_activate_and_roll_back_from_the_cli() -> Result<()> {
    let harness = Harness::new();
    seed_data(&harness.config.data_db, 600, None).await?;
    let plan = write_plan(&harness)?;

    let output = tableshift(&harness)?
        .args(["start", "--json", "--plan"])
        .arg(&plan)
        .output()?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let status = stdout_json(&output);
    assert_eq!(status["state"], "active");
    assert_eq!(status["active_table"], "listings_v2");
    assert_eq!(status["cursor"]["rows_processed"], 600);
    let id = status["id"].as_str().expect("id").to_string();

    let output = tableshift(&harness)?.args(["active", "listings", "--json"]).output()?;
    assert!(output.status.success());
    let designation = stdout_json(&output);
    assert_eq!(designation["table"], "listings_v2");
    assert_eq!(designation["generation"], 1);

    let output = tableshift(&harness)?.args(["status", "--json"]).output()?;
    let listed = stdout_json(&output);
    assert_eq!(listed[0][0], Json::String(id.clone()));
    assert_eq!(listed[0][1], "active");

    tableshift(&harness)?.args(["verify", id.as_str()]).assert().success();

    let output = tableshift(&harness)?.args(["status", id.as_str()]).output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("verification: passed at 20"), "stdout: {text}");
    assert!(text.contains("Z  verified -> active"), "stdout: {text}");

    let output = tableshift(&harness)?.args(["rollback", id.as_str(), "--json"]).output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), "rolled_back");

    let output = tableshift(&harness)?.args(["active", "listings"]).output()?;
    assert!(String::from_utf8_lossy(&output.stdout).contains("listings -> listings (generation 2)"));
    Ok(())
}

#[tokio::test]
async fn constraint_violation_exits_with_blocked_code() -> Result<()> {
    let harness = Harness::new();
    seed_data(&harness.config.data_db, 120, Some(77)).await?;
    let plan = write_plan(&harness)?;

    let output = tableshift(&harness)?.arg("start").arg("--plan").arg(&plan).output()?;
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Offending keys: 77"), "stderr: {stderr}");

    let output = tableshift(&harness)?.args(["status", "--json"]).output()?;
    let listed = stdout_json(&output);
    assert_eq!(listed[0][1], "validating");
    let id = listed[0][0].as_str().expect("id").to_string();

    let output = tableshift(&harness)?
        .args(["validate-constraints", id.as_str(), "--json"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    let reports = stdout_json(&output);
    assert_eq!(reports[0]["orphan_count"], 1);
    assert_eq!(reports[0]["orphans"][0]["key"], 77);
    Ok(())
}

#[tokio::test]
async fn failed_verification_prints_only_the_report() -> Result<()> {
    let harness = Harness::new();
    seed_data(&harness.config.data_db, 200, None).await?;
    let plan = write_plan(&harness)?;

    let output = tableshift(&harness)?
        .args(["start", "--json", "--plan"])
        .arg(&plan)
        .output()?;
    assert!(output.status.success());
    let id = stdout_json(&output)["id"].as_str().expect("id").to_string();

    let pool = open_sqlite_pool(&harness.config.data_db, 1).await?;
    sqlx::query("DELETE FROM listings_v2 WHERE id = 9")
        .execute(&pool)
        .await?;
    pool.close().await;

    let output = tableshift(&harness)?.args(["verify", id.as_str(), "--json"]).output()?;
    assert_eq!(output.status.code(), Some(2));
    let report = stdout_json(&output);
    assert_eq!(report["source_count"], 200);
    assert_eq!(report["target_count"], 199);
    assert_eq!(report["checksum_match"], false);
    assert!(String::from_utf8_lossy(&output.stderr).contains("verification failed"));
    Ok(())
}

#[tokio::test]
async fn unknown_migration_is_a_plain_error() -> Result<()> {
    let harness = Harness::new();
    seed_data(&harness.config.data_db, 1, None).await?;

    let output = tableshift(&harness)?
        .args(["verify", "01890a5d-ac96-774b-bcce-b302099a8057"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("MIGRATION/NOT_FOUND"));

    let missing = harness.dir.path().join("nope.json");
    let output = tableshift(&harness)?.arg("start").arg("--plan").arg(&missing).output()?;
    assert_eq!(output.status.code(), Some(1));
    Ok(())
}
