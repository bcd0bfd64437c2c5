#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use sqlx::SqlitePool;
use tableshift::config::EngineConfig;
use tableshift::{MigrationPlan, Orchestrator};
use tempfile::TempDir;

pub const PLAN_JSON: &str = include_str!("../demos/listings_v2_plan.json");

pub const TYPES: &[&str] = &[
    "House", "Villa", "Condo", "Townhouse", "Apartment", "Studio", "Cottage",
];

pub const HOSTS: i64 = 50;

/// Temp directory holding a data and a metadata database.
pub struct Harness {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig {
            data_db: dir.path().join("data.sqlite3"),
            metadata_db: dir.path().join("tableshift.sqlite3"),
            retry_backoff_ms: 5,
            max_backoff_ms: 50,
            ..EngineConfig::default()
        };
        configure(&mut config);
        Self { dir, config }
    }

    pub async fn orchestrator(&self) -> Orchestrator {
        Orchestrator::open(self.config.clone())
            .await
            .expect("open orchestrator")
    }
}

pub fn listings_plan(batch_size: u32) -> MigrationPlan {
    let mut plan = MigrationPlan::from_json_str(PLAN_JSON).expect("demo plan parses");
    plan.batch_size = batch_size;
    plan
}

/// Demo plan without its constraint changes.
pub fn unconstrained_plan(batch_size: u32) -> MigrationPlan {
    let mut plan = listings_plan(batch_size);
    plan.constraints.clear();
    plan
}

pub async fn create_source(pool: &SqlitePool) {
    sqlx::query("CREATE TABLE profiles (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE listings (
            id INTEGER PRIMARY KEY,
            host_id INTEGER,
            property_type TEXT NOT NULL,
            square_feet INTEGER,
            price_per_night REAL
        )",
    )
    .execute(pool)
    .await
    .unwrap();
    for id in 1..=HOSTS {
        sqlx::query("INSERT INTO profiles (id, name) VALUES (?1, ?2)")
            .bind(id)
            .bind(format!("host {id}"))
            .execute(pool)
            .await
            .unwrap();
    }
}

/// Insert listings `first..=last` with deterministic values.
pub async fn seed_listings(pool: &SqlitePool, first: i64, last: i64) {
    let mut tx = pool.begin().await.unwrap();
    for id in first..=last {
        sqlx::query(
            "INSERT INTO listings (id, host_id, property_type, square_feet, price_per_night)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id)
        .bind(id % HOSTS + 1)
        .bind(TYPES[(id as usize) % TYPES.len()])
        .bind(400 + (id * 37) % 3000)
        .bind(40.0 + (id % 150) as f64)
        .execute(&mut *tx)
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
}

pub async fn seeded(pool: &SqlitePool, rows: i64) {
    create_source(pool).await;
    seed_listings(pool, 1, rows).await;
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn set_square_feet(pool: &SqlitePool, id: i64, sqft: Option<i64>) {
    sqlx::query("UPDATE listings SET square_feet = ?1 WHERE id = ?2")
        .bind(sqft)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn trigger_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'tableshift_%'",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

pub type TargetSnapshot = Vec<(i64, Option<i64>, String, i64, i64, Option<f64>, String)>;

pub async fn snapshot(pool: &SqlitePool) -> TargetSnapshot {
    sqlx::query_as(
        "SELECT id, host_id, property_type, square_feet, garage_number, monthly_price, listing_type
         FROM listings_v2 ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}
