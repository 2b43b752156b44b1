//! End-to-end workflow scenarios against the mock provider: happy path,
//! partial failure, token-limit retry, partial expiration, cancel,
//! recovery.

mod common;

use std::sync::atomic::Ordering;

use batchd_core::provider::{ProviderBatchError, ProviderRequestCounts};
use batchd_core::services::{dispatch_all, recovery, start_upload};
use batchd_core::store::{batches, requests};
use batchd_core::{BatchState, RequestState};
use chrono::Utc;
use common::{
    drain_jobs, err_line, ok_line, snapshot, spawn_webhook_receiver, submit, test_broker, webhook,
};

/// Submit requests into one batch and promote it to `uploading`.
async fn submit_and_promote(
    t: &common::TestBroker,
    custom_ids: &[&str],
    webhook_url: &str,
) -> String {
    let mut batch_id = None;
    for custom_id in custom_ids {
        let request = t
            .broker
            .submit_request(submit(custom_id, "gpt-4o-mini", webhook(webhook_url)))
            .await
            .expect("submit");
        batch_id = Some(request.batch_id);
    }
    let batch_id = batch_id.unwrap();
    start_upload(&t.broker.db.pool, &t.broker.jobs, &t.broker.events, &batch_id)
        .await
        .expect("promote");
    batch_id
}

#[tokio::test]
async fn happy_path_webhook_delivery() {
    let t = test_broker().await;
    let (hook_url, hits) = spawn_webhook_receiver().await;

    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    done.request_counts = Some(ProviderRequestCounts { total: 3, completed: 3, failed: 0 });
    t.provider.script_poll(done).await;
    t.provider
        .put_file(
            "f-out",
            format!("{}\n{}\n{}\n", ok_line("A"), ok_line("B"), ok_line("C")),
        )
        .await;

    let batch_id = submit_and_promote(&t, &["A", "B", "C"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);
    assert_eq!(batch.provider_requests_completed, 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    for request in requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap() {
        assert_eq!(request.state().unwrap(), RequestState::Delivered);
        assert!(request.response_payload.is_some());
        assert!(request.error_msg.is_none());
        let attempts =
            requests::delivery_attempts(&t.broker.db.pool, &request.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, "success");
    }

    // The audit chain walks the whole lifecycle
    let transitions = batches::transitions(&t.broker.db.pool, &batch_id).await.unwrap();
    let states: Vec<&str> = transitions.iter().map(|tr| tr.to_state.as_str()).collect();
    assert_eq!(
        states,
        [
            "uploading",
            "uploaded",
            "openai_processing",
            "openai_completed",
            "downloading",
            "ready_to_deliver",
            "delivering",
            "delivered",
        ]
    );
    for pair in transitions.windows(2) {
        assert_eq!(pair[0].to_state, pair[1].from_state, "chain is connected");
    }
}

#[tokio::test]
async fn partial_failure_splits_outcomes() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    done.error_file_id = Some("f-err".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;
    let b_error = err_line("B", "rate_limited");
    t.provider.put_file("f-err", format!("{}\n", b_error)).await;

    let batch_id = submit_and_promote(&t, &["A", "B"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::PartiallyDelivered);

    let all = requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap();
    let a = all.iter().find(|r| r.custom_id == "A").unwrap();
    let b = all.iter().find(|r| r.custom_id == "B").unwrap();
    assert_eq!(a.state().unwrap(), RequestState::Delivered);
    assert_eq!(b.state().unwrap(), RequestState::Failed);
    assert_eq!(b.error_msg.as_deref(), Some(b_error.as_str()), "full line kept");
    assert!(b.response_payload.is_none());
}

#[tokio::test]
async fn token_limit_retry_backs_off_then_succeeds() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    let mut limited = snapshot("failed");
    limited.errors = vec![ProviderBatchError {
        code: Some("token_limit_exceeded".to_string()),
        message: Some("Enqueued token limit reached".to_string()),
    }];
    t.provider.script_poll(limited).await;

    let batch_id = submit_and_promote(&t, &["A"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::WaitingForCapacity);
    assert_eq!(batch.token_limit_retry_attempts, 1);
    assert!(batch.token_limit_retry_next_at.unwrap() > Utc::now());
    assert_eq!(batch.capacity_wait_reason.as_deref(), Some("token_limit_exceeded_backoff"));
    assert!(batch.provider_batch_id.is_none());

    let all = requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(all[0].state().unwrap(), RequestState::Pending);

    // Dispatcher skips the batch while the backoff is pending
    assert_eq!(dispatch_all(&t.broker.workflow).await.unwrap(), 0);

    // Backoff elapses; the provider accepts the retry
    sqlx::query("UPDATE batches SET token_limit_retry_next_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::seconds(1))
        .bind(&batch_id)
        .execute(&t.broker.db.pool)
        .await
        .unwrap();
    {
        let mut polls = t.provider.polls.lock().await;
        polls.clear();
    }
    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;

    assert_eq!(dispatch_all(&t.broker.workflow).await.unwrap(), 1);
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);
    assert_eq!(batch.token_limit_retry_attempts, 0, "backoff resets on success");
    let all = requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(all[0].state().unwrap(), RequestState::Delivered);
}

#[tokio::test]
async fn expired_with_partial_output_resubmits_remainder() {
    let t = test_broker().await;
    let (hook_url, hits) = spawn_webhook_receiver().await;

    let mut expired = snapshot("expired");
    expired.output_file_id = Some("f-out".to_string());
    t.provider.script_poll(expired).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;

    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out-2".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out-2", format!("{}\n", ok_line("B"))).await;

    let batch_id = submit_and_promote(&t, &["A", "B"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // The resubmission uploaded only the unanswered request
    let uploads = t.provider.uploads.lock().await;
    assert_eq!(uploads.len(), 2);
    let second = String::from_utf8(uploads[1].clone()).unwrap();
    assert!(second.contains("\"custom_id\":\"B\""));
    assert!(!second.contains("\"custom_id\":\"A\""));

    // The audit chain passes through expired -> uploading
    let transitions = batches::transitions(&t.broker.db.pool, &batch_id).await.unwrap();
    let states: Vec<&str> = transitions.iter().map(|tr| tr.to_state.as_str()).collect();
    assert!(states.contains(&"expired"));
    let expired_pos = states.iter().position(|s| *s == "expired").unwrap();
    assert_eq!(states[expired_pos + 1], "uploading");
}

#[tokio::test]
async fn expired_with_no_output_resubmits_everything() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    t.provider.script_poll(snapshot("expired")).await;
    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;

    let batch_id = submit_and_promote(&t, &["A"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);

    // The input file is reused: exactly one upload, two provider batches
    assert_eq!(t.provider.uploads.lock().await.len(), 1);
    assert_eq!(t.provider.created.lock().await.len(), 2);
}

#[tokio::test]
async fn cancel_mid_flight_cancels_requests_and_jobs() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    t.provider.script_poll(snapshot("in_progress")).await;
    let batch_id = submit_and_promote(&t, &["A", "B"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::OpenaiProcessing);
    let provider_batch_id = batch.provider_batch_id.clone().unwrap();

    t.broker.workflow.cancel_batch(&batch_id).await.unwrap();

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Cancelled);
    for request in requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap() {
        assert_eq!(request.state().unwrap(), RequestState::Cancelled);
    }
    assert_eq!(t.provider.cancelled.lock().await.as_slice(), [provider_batch_id]);
    assert_eq!(t.broker.jobs.live_count().await.unwrap(), 0);

    // Cancelling again is rejected: the batch is terminal
    assert!(t.broker.workflow.cancel_batch(&batch_id).await.is_err());
}

#[tokio::test]
async fn provider_failure_fails_batch_and_requests() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    let mut failed = snapshot("failed");
    failed.errors = vec![ProviderBatchError {
        code: Some("invalid_request".to_string()),
        message: Some("input file is malformed".to_string()),
    }];
    t.provider.script_poll(failed).await;

    let batch_id = submit_and_promote(&t, &["A"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Failed);
    assert!(batch.error_msg.as_deref().unwrap().contains("invalid_request"));
    let all = requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(all[0].state().unwrap(), RequestState::Failed);
}

#[tokio::test]
async fn completed_without_result_files_fails_batch() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    t.provider.script_poll(snapshot("completed")).await;

    let batch_id = submit_and_promote(&t, &["A"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Failed);
    assert!(batch.error_msg.as_deref().unwrap().contains("without any result file"));
}

#[tokio::test]
async fn redeliver_retries_failed_deliveries() {
    let t = test_broker().await;

    // First delivery goes to a dead endpoint
    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;

    let batch_id = submit_and_promote(&t, &["A"], "http://127.0.0.1:1/hook").await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::DeliveryFailed);
    let all = requests::list_for_batch(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(all[0].state().unwrap(), RequestState::DeliveryFailed);
    let attempts = requests::delivery_attempts(&t.broker.db.pool, &all[0].id).await.unwrap();
    assert_eq!(attempts.len() as i64, 3, "bounded delivery attempts");
    assert!(attempts.iter().all(|a| a.outcome != "success"));

    // Point the sink somewhere real and redeliver
    let (hook_url, hits) = spawn_webhook_receiver().await;
    sqlx::query("UPDATE requests SET delivery_config = ? WHERE id = ?")
        .bind(format!(r#"{{"type":"webhook","url":"{}"}}"#, hook_url))
        .bind(&all[0].id)
        .execute(&t.broker.db.pool)
        .await
        .unwrap();

    t.broker.workflow.redeliver(&batch_id, false).await.unwrap();
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recovery_reenqueues_in_flight_batches() {
    let t = test_broker().await;
    let (hook_url, _hits) = spawn_webhook_receiver().await;

    t.provider.script_poll(snapshot("in_progress")).await;
    let batch_id = submit_and_promote(&t, &["A"], &hook_url).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::OpenaiProcessing);
    assert_eq!(t.broker.jobs.live_count().await.unwrap(), 0);

    // Simulate a restart: nothing queued, recovery rebuilds the trigger
    let recovered = recovery::recover(&t.broker.db.pool, &t.broker.jobs).await.unwrap();
    assert_eq!(recovered, 1);
    let pending = t
        .broker
        .jobs
        .pending_of_kind(batchd_core::jobs::JobKind::PollStatus)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].batch_id.as_deref(), Some(batch_id.as_str()));

    // And the poll proceeds to completion once the provider finishes
    {
        let mut polls = t.provider.polls.lock().await;
        polls.clear();
    }
    let mut done = snapshot("completed");
    done.output_file_id = Some("f-out".to_string());
    t.provider.script_poll(done).await;
    t.provider.put_file("f-out", format!("{}\n", ok_line("A"))).await;
    drain_jobs(&t).await;

    let batch = batches::get(&t.broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Delivered);
}
