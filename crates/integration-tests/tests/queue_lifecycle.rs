//! Enqueue -> claim -> process -> settle, end to end on SQLite

mod common;

use cairn_core::application::{EnqueueRequest, Worker};
use cairn_core::domain::{JobEventKind, JobStatus};
use cairn_core::error::AppError;
use cairn_core::port::job_processor::mocks::{MockBehavior, MockProcessor};
use cairn_core::port::{JobStore, TimeProvider};
use common::{mock_harness, QUEUE};
use serde_json::json;
use std::sync::Arc;

fn bookmark(id: &str) -> EnqueueRequest {
    EnqueueRequest::for_asset(QUEUE, id, "user-1", json!({ "url": format!("https://example.com/{}", id) }))
}

#[tokio::test]
async fn test_happy_path_completes_with_stages_and_events() {
    let (h, _time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1")).await.unwrap();
    assert_eq!(handle.status, JobStatus::Pending);
    assert_eq!(handle.dedup_key, format!("{}:b1", QUEUE));

    let processor = Arc::new(MockProcessor::new_success().with_stages(&["fetch", "extract", "index"]));
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());
    assert!(worker.process_next_job().await.unwrap());

    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.overall_progress, 100);
    assert_eq!(job.stages.len(), 3);
    assert!(job.locked_by.is_none());
    assert!(job.completed_at.is_some());

    let kinds = h.events.kinds();
    assert_eq!(kinds.first(), Some(&JobEventKind::JobCreated));
    assert_eq!(kinds.last(), Some(&JobEventKind::JobCompleted));

    let last = h.events.events().pop().unwrap();
    assert_eq!(last.user_id, "user-1");
    assert_eq!(last.event.summary.unwrap().completed, 1);

    // Nothing left
    assert!(!worker.process_next_job().await.unwrap());
}

#[tokio::test]
async fn test_duplicate_enqueue_keeps_one_row() {
    let (h, time) = mock_harness().await;
    let first = h.adapter.enqueue(bookmark("b1")).await.unwrap();

    time.advance(1_000);
    let req = EnqueueRequest::for_asset(QUEUE, "b1", "user-1", json!({ "url": "https://example.com/new" }));
    let second = h.adapter.enqueue(req).await.unwrap();
    assert_eq!(second.id, first.id);

    let job = h.store.find_by_key(QUEUE, "bookmark-processing:b1").await.unwrap().unwrap();
    assert_eq!(job.payload.as_value()["url"], json!("https://example.com/new"));
    assert_eq!(h.store.status_counts("user-1").await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_re_enqueue_of_completed_job_runs_again() {
    let (h, time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1")).await.unwrap();
    let processor = Arc::new(MockProcessor::new_success());
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());
    assert!(worker.process_next_job().await.unwrap());

    time.advance(1_000);
    let again = h.adapter.enqueue(bookmark("b1")).await.unwrap();
    assert_eq!(again.id, handle.id);
    assert_eq!(again.status, JobStatus::Pending);

    assert!(worker.process_next_job().await.unwrap());
    assert_eq!(processor.call_count(), 2);
    assert_eq!(h.store.count_completed(QUEUE, "b1", None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failures_stop_at_retry_budget() {
    let (h, _time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1").with_max_retries(2)).await.unwrap();
    let processor = Arc::new(MockProcessor::new_fail("upstream 500"));
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());

    // One initial attempt plus two retries
    for _ in 0..3 {
        assert!(worker.process_next_job().await.unwrap());
    }
    assert!(!worker.process_next_job().await.unwrap());

    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error_message.as_deref(), Some("upstream 500"));
    assert_eq!(processor.call_count(), 3);
}

#[tokio::test]
async fn test_invalid_job_fails_without_retry() {
    let (h, _time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1")).await.unwrap();
    let processor = Arc::new(MockProcessor::new(MockBehavior::Invalid("missing url".into())));
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());

    assert!(worker.process_next_job().await.unwrap());
    assert!(!worker.process_next_job().await.unwrap());

    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(processor.call_count(), 1);
}

#[tokio::test]
async fn test_rate_limited_job_is_rescheduled_without_consuming_retry() {
    let (h, time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1")).await.unwrap();
    let processor = Arc::new(MockProcessor::new(MockBehavior::RateLimited(60_000)));
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());

    assert!(worker.process_next_job().await.unwrap());
    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.scheduled_for, time.now_millis() + 60_000);

    // Not due yet
    assert!(!worker.process_next_job().await.unwrap());

    processor.set_behavior(MockBehavior::Success);
    time.advance(60_000);
    assert!(worker.process_next_job().await.unwrap());
    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_operator_retry_and_forced_rerun() {
    let (h, _time) = mock_harness().await;
    let handle = h.adapter.enqueue(bookmark("b1").with_max_retries(0)).await.unwrap();
    let processor = Arc::new(MockProcessor::new_fail("boom"));
    let worker = Worker::new("w1", QUEUE, h.adapter.clone(), processor.clone());
    assert!(worker.process_next_job().await.unwrap());

    // Budget exhausted: only a forced re-run is allowed
    let err = h.adapter.retry(&handle.id, false).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let rerun = h.adapter.retry(&handle.id, true).await.unwrap();
    assert_eq!(rerun.status, JobStatus::RetryPending);
    assert_eq!(rerun.retry_count, 0);
    assert!(rerun.error_message.is_none());

    processor.set_behavior(MockBehavior::Success);
    assert!(worker.process_next_job().await.unwrap());
    let job = h.adapter.find(&handle.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let missing = h.adapter.retry(&"no-such-job".to_string(), true).await.unwrap_err();
    assert!(matches!(missing, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_request_is_never_persisted() {
    let (h, _time) = mock_harness().await;
    let bad = EnqueueRequest::new("bad queue!", "k1", "a1", "user-1", json!({}));
    let err = h.adapter.enqueue(bad).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.store.status_counts("user-1").await.unwrap().total(), 0);
    assert!(h.events.kinds().is_empty());
}
