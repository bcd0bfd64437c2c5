#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use tableshift::backfill::{run_batch, BatchObserver, BatchStats};
use tableshift::schema::ensure_table;
use tableshift::{codes, MigrationState, Value};

mod util;
use util::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumes_from_the_last_checkpoint_after_a_crash() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 10_000).await;
    let id = orchestrator.prepare(listings_plan(1_000)).await.unwrap();

    let crash: BatchObserver = Arc::new(|stats: &BatchStats| {
        if stats.batch_index == 4 {
            panic!("simulated crash after batch {}", stats.batch_index);
        }
    });
    let crashing = orchestrator.clone().with_observer(crash);
    let joined = tokio::spawn(async move { crashing.resume(id).await }).await;
    assert!(joined.unwrap_err().is_panic());

    let cursor = orchestrator.store().load_cursor(id).await.unwrap();
    assert_eq!(cursor.batches_committed, 4);
    assert_eq!(cursor.rows_processed, 4_000);
    assert_eq!(cursor.last_processed_key, Some(Value::Integer(4_000)));
    assert_eq!(
        orchestrator.status(id).await.unwrap(),
        MigrationState::Backfilling
    );
    assert_eq!(count(&pool, "listings_v2").await, 4_000);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let restarted = harness
        .orchestrator()
        .await
        .with_observer(Arc::new(move |stats: &BatchStats| {
            sink.lock().unwrap().push(stats.batch_index);
        }));
    let state = restarted.resume(id).await.unwrap();
    assert_eq!(state, MigrationState::Active);

    let batches = seen.lock().unwrap().clone();
    assert_eq!(batches, (5..=10).collect::<Vec<u64>>());
    let cursor = restarted.store().load_cursor(id).await.unwrap();
    assert_eq!(cursor.rows_processed, 10_000);
    assert_eq!(cursor.rows_failed, 0);
    assert_eq!(count(&pool, "listings_v2").await, 10_000);

    let report = restarted.verify(id).await.unwrap();
    assert!(report.passed(), "{report:?}");

    // A crash-free run over the same source produces the same target.
    let clean = Harness::new();
    let fresh = clean.orchestrator().await;
    seeded(fresh.data_pool(), 10_000).await;
    fresh.start_migration(listings_plan(1_000)).await.unwrap();
    assert_eq!(snapshot(&pool).await, snapshot(fresh.data_pool()).await);
}

#[tokio::test]
async fn counters_match_the_source_prefix_at_every_checkpoint() {
    let harness = Harness::with_config(|c| c.workers = 3);
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 3_000).await;
    let bad: Vec<i64> = (1..=3_000).filter(|id| id % 250 == 0).collect();
    for id in &bad {
        set_square_feet(&pool, *id, Some(-5)).await;
    }

    let seen = Arc::new(Mutex::new(Vec::<BatchStats>::new()));
    let sink = Arc::clone(&seen);
    let orchestrator = orchestrator.with_observer(Arc::new(move |stats: &BatchStats| {
        sink.lock().unwrap().push(stats.clone());
    }));
    let id = orchestrator.prepare(listings_plan(200)).await.unwrap();
    let err = orchestrator.resume(id).await.unwrap_err();
    assert_eq!(err.code(), codes::INTEGRITY_MISMATCH);
    assert_eq!(
        orchestrator.status(id).await.unwrap(),
        MigrationState::Validating
    );

    let checkpoints = seen.lock().unwrap().clone();
    assert_eq!(checkpoints.len(), 15);
    for stats in &checkpoints {
        let Some(Value::Integer(last)) = stats.last_key else {
            panic!("checkpoint without a key: {stats:?}");
        };
        let covered: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings WHERE id <= ?1")
            .bind(last)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(
            stats.rows_processed + stats.rows_failed,
            covered as u64,
            "checkpoint {}",
            stats.batch_index
        );
        let failed = bad.iter().filter(|id| **id <= last).count() as u64;
        assert_eq!(stats.rows_failed, failed);
    }
    assert_eq!(count(&pool, "listings_v2").await, 3_000 - bad.len() as i64);

    for id in &bad {
        set_square_feet(&pool, *id, Some(900)).await;
    }
    let summary = orchestrator.retry_failed_rows(id).await.unwrap();
    assert_eq!(summary.attempted, bad.len() as u64);
    assert_eq!(summary.recovered, bad.len() as u64);
    assert_eq!(summary.still_failing, 0);

    let cursor = orchestrator.store().load_cursor(id).await.unwrap();
    assert_eq!(cursor.rows_processed, 3_000);
    assert_eq!(cursor.rows_failed, 0);

    assert_eq!(orchestrator.resume(id).await.unwrap(), MigrationState::Active);
    assert_eq!(count(&pool, "listings_v2").await, 3_000);
}

#[tokio::test]
async fn replaying_a_batch_leaves_the_target_unchanged() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 1_200).await;
    let plan = listings_plan(500);
    let id = orchestrator.prepare(plan.clone()).await.unwrap();
    ensure_table(&pool, &plan.target).await.unwrap();
    let store = orchestrator.store();

    let start = store.load_cursor(id).await.unwrap();
    let (first, result) = run_batch(&pool, store, &plan, &start).await.unwrap();
    assert_eq!(result.rows_written, 500);
    assert_eq!(first.last_processed_key, Some(Value::Integer(500)));
    let before = snapshot(&pool).await;

    sqlx::query("UPDATE listings_v2 SET garage_number = 99 WHERE id = 42")
        .execute(&pool)
        .await
        .unwrap();
    let (after_replay, replayed) = run_batch(&pool, store, &plan, &start).await.unwrap();
    assert_eq!(replayed.rows_written, 500);
    assert_eq!(after_replay, first);
    assert_eq!(store.load_cursor(id).await.unwrap().rows_processed, 500);
    assert_eq!(replayed.last_key, result.last_key);
    assert_eq!(snapshot(&pool).await, before);

    let (second, _) = run_batch(&pool, store, &plan, &first).await.unwrap();
    let (third, _) = run_batch(&pool, store, &plan, &second).await.unwrap();
    assert_eq!(third.last_processed_key, Some(Value::Integer(1_200)));
    let (done, empty) = run_batch(&pool, store, &plan, &third).await.unwrap();
    assert_eq!(empty.rows_read, 0);
    assert_eq!(done.last_processed_key, third.last_processed_key);
    assert_eq!(count(&pool, "listings_v2").await, 1_200);
}
