use std::sync::Arc;
use std::time::Duration;

use rcpdb_core::error::Error;
use rcpdb_ingest::jobs::{JobManager, JobRecord, JobStatus};
use rcpdb_ingest::pipeline::ProgressSink;

async fn wait_terminal(manager: &Arc<JobManager>, job_id: &str) -> JobRecord {
    for _ in 0..500 {
        let record = manager.status(job_id).expect("job exists");
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached a terminal state");
}

#[tokio::test]
async fn completed_job_carries_result_and_timestamps() {
    let manager = JobManager::new();
    let job_id = manager.start("indexing", "rcp_documents", |_ctx| async {
        Ok(serde_json::json!({ "processed": 3 }))
    });

    let record = wait_terminal(&manager, &job_id).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(serde_json::json!({ "processed": 3 })));
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
    assert!(record.error.is_none());
}

#[tokio::test]
async fn failed_job_reports_structured_error() {
    let manager = JobManager::new();
    let job_id = manager.start("indexing", "rcp_documents", |_ctx| async {
        Err(Error::External("object store unreachable".into()))
    });

    let record = wait_terminal(&manager, &job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error.expect("error recorded");
    assert_eq!(error.kind, "external_unavailable");
    assert!(error.message.contains("object store unreachable"));
}

#[tokio::test]
async fn panicking_worker_becomes_failed_not_a_crash() {
    let manager = JobManager::new();
    let job_id = manager.start("indexing", "rcp_documents", |_ctx| async {
        if true {
            panic!("boom");
        }
        Ok(serde_json::Value::Null)
    });

    let record = wait_terminal(&manager, &job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.expect("error").kind, "internal");
}

#[tokio::test]
async fn starting_twice_joins_the_running_job() {
    let manager = JobManager::new();
    let first = manager.start("indexing", "rcp_documents", |ctx| async move {
        while !ctx.cancel_token().is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(serde_json::Value::Null)
    });
    let second = manager.start("indexing", "rcp_documents", |_ctx| async {
        Ok(serde_json::Value::Null)
    });
    assert_eq!(first, second);

    // A different collection is a different job.
    let other = manager.start("indexing", "other_collection", |_ctx| async {
        Ok(serde_json::Value::Null)
    });
    assert_ne!(first, other);

    assert!(manager.cancel(&first));
    let record = wait_terminal(&manager, &first).await;
    assert_eq!(record.status, JobStatus::Cancelled);

    // The slot frees up once the job is terminal.
    let third = manager.start("indexing", "rcp_documents", |_ctx| async {
        Ok(serde_json::Value::Null)
    });
    assert_ne!(third, first);
    wait_terminal(&manager, &third).await;
}

#[tokio::test]
async fn cancel_is_cooperative_and_sticky() {
    let manager = JobManager::new();
    let job_id = manager.start("indexing", "rcp_documents", |ctx| async move {
        loop {
            ctx.cancel_token().check()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.cancel(&job_id));
    let record = wait_terminal(&manager, &job_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);

    // Terminal states are sticky; cancelling again is a no-op.
    assert!(!manager.cancel(&job_id));
    assert!(!manager.cancel("no-such-job"));
}

#[tokio::test]
async fn progress_is_monotonically_non_regressing() {
    let manager = JobManager::new();
    let job_id = manager.start("indexing", "rcp_documents", |ctx| async move {
        ctx.progress(5, 10, "f5");
        // A late, out-of-order update must not move the counter backwards.
        ctx.progress(3, 10, "f3");
        ctx.file_ok("f5");
        ctx.file_failed("f9", "timeout");
        Ok(serde_json::Value::Null)
    });

    let record = wait_terminal(&manager, &job_id).await;
    assert_eq!(record.progress.current, 5);
    assert_eq!(record.progress.total, 10);
    assert_eq!(record.progress.processed_ok, 1);
    assert_eq!(record.progress.processed_failed, 1);
    assert_eq!(record.progress.failed_items[0].id, "f9");
    assert_eq!(record.progress.failed_items[0].reason, "timeout");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let manager = JobManager::new();
    let err = manager.status("missing").unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn restart_sweeps_in_flight_jobs_to_failed() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("jobs.log");

    let manager = JobManager::with_persistence(log_path.clone());
    let job_id = manager.start("indexing", "rcp_documents", |_ctx| async {
        Ok(serde_json::json!({ "processed": 1 }))
    });
    wait_terminal(&manager, &job_id).await;
    drop(manager);

    // Simulate a job that was mid-flight when the process died.
    let stale = serde_json::json!({
        "job_id": "stale-1",
        "op": "indexing",
        "collection": "rcp_documents",
        "status": "running",
        "created_at": "2025-01-01T00:00:00Z",
        "started_at": "2025-01-01T00:00:01Z",
        "finished_at": null,
        "progress": {
            "current": 10, "total": 100, "current_item": "f10",
            "processed_ok": 9, "processed_failed": 1,
            "failed_items": [{"id": "f3", "reason": "timeout"}]
        },
        "result": null,
        "error": null
    });
    let mut content = std::fs::read_to_string(&log_path).unwrap();
    content.push_str(&format!("{}\n", stale));
    std::fs::write(&log_path, content).unwrap();

    let revived = JobManager::with_persistence(log_path);
    let finished = revived.status(&job_id).expect("completed job survives");
    assert_eq!(finished.status, JobStatus::Completed);

    let swept = revived.status("stale-1").expect("stale job survives");
    assert_eq!(swept.status, JobStatus::Failed);
    assert_eq!(swept.error.expect("error").message, "restart");
}
