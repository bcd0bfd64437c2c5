#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use tableshift::verify::sample_rank;
use tableshift::{codes, Value};

mod util;
use util::*;

#[tokio::test]
async fn tampered_values_and_missing_rows_fail_verification() {
    let harness = Harness::with_config(|c| c.sample.ratio = 1.0);
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 400).await;
    let id = orchestrator.start_migration(listings_plan(100)).await.unwrap();

    let clean = orchestrator.verify(id).await.unwrap();
    assert!(clean.passed());
    assert_eq!(clean.sample_size(), 400);
    assert_eq!(clean.source_checksum(), clean.target_checksum());

    // Rewriting a row with the value it already derives to is not a mismatch.
    sqlx::query("UPDATE listings_v2 SET monthly_price = monthly_price WHERE id = 10")
        .execute(&pool)
        .await
        .unwrap();
    assert!(orchestrator.verify(id).await.unwrap().passed());

    let derived: i64 = sqlx::query_scalar("SELECT garage_number FROM listings_v2 WHERE id = 77")
        .fetch_one(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE listings_v2 SET garage_number = 7 WHERE id = 77")
        .execute(&pool)
        .await
        .unwrap();
    let report = orchestrator.verify(id).await.unwrap();
    assert!(!report.passed());
    assert!(report.checksum_match());
    let mismatches = report.sampled_mismatches();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].key, Value::Integer(77));
    assert_eq!(mismatches[0].field, "garage_number");
    assert_eq!(mismatches[0].source_value, Value::Integer(derived));
    assert_eq!(mismatches[0].target_value, Value::Integer(7));

    sqlx::query("DELETE FROM listings_v2 WHERE id = 78")
        .execute(&pool)
        .await
        .unwrap();
    let report = orchestrator.verify(id).await.unwrap();
    assert_eq!(report.source_count(), 400);
    assert_eq!(report.target_count(), 399);
    assert!(!report.checksum_match());
    let missing = report
        .sampled_mismatches()
        .iter()
        .find(|m| m.key == Value::Integer(78))
        .expect("missing row reported");
    assert_eq!(missing.field, "id");
    assert_eq!(missing.target_value, Value::Null);

    let status = orchestrator.describe(id).await.unwrap();
    assert_eq!(status.verification_attempt, Some(6));
    assert!(status.verification.is_some_and(|r| !r.passed()));
}

#[tokio::test]
async fn sample_is_seeded_and_reproducible() {
    let harness = Harness::with_config(|c| {
        c.sample.ratio = 0.05;
        c.sample.floor = 0;
        c.sample.seed = 42;
    });
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 1_000).await;
    let id = orchestrator.start_migration(listings_plan(250)).await.unwrap();

    // Every row now differs, so the mismatches name exactly the sampled keys.
    sqlx::query("UPDATE listings_v2 SET listing_type = 'tampered'")
        .execute(&pool)
        .await
        .unwrap();
    let sampled = |report: &tableshift::VerificationReport| -> BTreeSet<i64> {
        report
            .sampled_mismatches()
            .iter()
            .map(|m| match m.key {
                Value::Integer(k) => k,
                ref other => panic!("unexpected key {other}"),
            })
            .collect()
    };
    let first = orchestrator.verify(id).await.unwrap();
    let second = orchestrator.verify(id).await.unwrap();
    assert_eq!(first.sample_size(), 50);
    assert_eq!(sampled(&first), sampled(&second));

    let mut ranked: Vec<(u64, i64)> = (1..=1_000)
        .map(|k| (sample_rank(42, &Value::Integer(k)), k))
        .collect();
    ranked.sort();
    let expected: BTreeSet<i64> = ranked.iter().take(50).map(|(_, k)| *k).collect();
    assert_eq!(sampled(&first), expected);

    let reseeded = Harness::with_config(|c| {
        c.data_db = harness.config.data_db.clone();
        c.metadata_db = harness.config.metadata_db.clone();
        c.sample.ratio = 0.05;
        c.sample.floor = 0;
        c.sample.seed = 7;
    });
    let other = reseeded.orchestrator().await.verify(id).await.unwrap();
    assert_eq!(other.sample_size(), 50);
    assert_ne!(sampled(&other), expected);
}

#[tokio::test]
async fn quarantined_rows_fail_verification_until_retried() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 200).await;
    set_square_feet(&pool, 50, Some(-1)).await;

    let id = orchestrator.prepare(listings_plan(100)).await.unwrap();
    let err = orchestrator.resume(id).await.unwrap_err();
    assert_eq!(err.code(), codes::INTEGRITY_MISMATCH);
    assert_eq!(err.context().get("quarantined").map(String::as_str), Some("1"));
    assert_eq!(err.context().get("target_count").map(String::as_str), Some("199"));

    let status = orchestrator.describe(id).await.unwrap();
    assert_eq!(status.quarantined, 1);
    let report = status.verification.expect("report persisted");
    assert_eq!(report.quarantined(), 1);
    assert!(report.sampled_mismatches().is_empty());

    // Nothing changed in the source, so the row stays quarantined.
    let summary = orchestrator.retry_failed_rows(id).await.unwrap();
    assert_eq!(summary.still_failing, 1);

    set_square_feet(&pool, 50, Some(0)).await;
    let summary = orchestrator.retry_failed_rows(id).await.unwrap();
    assert_eq!(summary.recovered, 1);
    assert!(orchestrator.verify(id).await.unwrap().passed());
    orchestrator.resume(id).await.unwrap();
    assert_eq!(count(&pool, "listings_v2").await, 200);
}
