#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use tableshift::codes;
use tracing_subscriber::{fmt, EnvFilter};

mod util;
use util::*;

#[tokio::test]
async fn lifecycle_events_are_logged_as_structured_json() {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer = buf.clone();
    let _ = fmt()
        .with_env_filter(EnvFilter::new("tableshift=info"))
        .with_writer(move || TestWriter(writer.clone()))
        .json()
        .try_init();

    let harness = Harness::with_config(|c| c.workers = 2);
    let orchestrator = harness.orchestrator().await;
    let pool = orchestrator.data_pool().clone();
    seeded(&pool, 300).await;
    set_square_feet(&pool, 42, Some(-1)).await;

    let id = orchestrator.prepare(listings_plan(100)).await.unwrap();
    let err = orchestrator.resume(id).await.unwrap_err();
    assert_eq!(err.code(), codes::INTEGRITY_MISMATCH);
    set_square_feet(&pool, 42, Some(10)).await;
    orchestrator.retry_failed_rows(id).await.unwrap();
    orchestrator.resume(id).await.unwrap();

    let logs = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    for event in [
        "migration_created",
        "migration_state_changed",
        "backfill_started",
        "backfill_batch_committed",
        "backfill_row_quarantined",
        "backfill_exhausted",
        "verification_completed",
        "migration_blocked",
        "quarantine_retried",
        "constraint_applied",
        "router_swapped",
        "migration_activated",
    ] {
        assert!(
            logs.contains(&format!("\"event\":\"{event}\"")),
            "missing {event} log: {logs}"
        );
    }
    assert!(
        logs.contains(&format!("\"migration_id\":\"{id}\"")),
        "logs lack the migration id: {logs}"
    );
}

#[derive(Clone)]
struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
