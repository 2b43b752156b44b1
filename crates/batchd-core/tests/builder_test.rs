//! Batch builder integration tests: aggregation, rotation, validation.

mod common;

use batchd_core::config::{MAX_BATCH_BYTES, MAX_REQUESTS_PER_BATCH};
use batchd_core::store::batches;
use batchd_core::{BatchState, DeliveryConfig};
use common::{submit, test_broker, test_broker_custom, webhook};

#[tokio::test]
async fn submitting_n_requests_yields_one_batch_with_n() {
    let t = test_broker().await;

    let mut batch_id = None;
    for i in 0..5 {
        let request = t
            .broker
            .submit_request(submit(&format!("req-{}", i), "gpt-4o-mini", webhook("https://x/h")))
            .await
            .expect("submit");
        match &batch_id {
            None => batch_id = Some(request.batch_id.clone()),
            Some(id) => assert_eq!(&request.batch_id, id, "all submits share one batch"),
        }
    }

    let batch = batches::get(&t.broker.db.pool, batch_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(batch.state().unwrap(), BatchState::Building);
    assert_eq!(batch.request_count, 5);
    assert!(batch.size_bytes > 0);
    assert!(batch.estimated_input_tokens_total > 0);
}

#[tokio::test]
async fn concurrent_submits_are_linearized_per_key() {
    let t = test_broker().await;
    let broker = &t.broker;

    let mut handles = Vec::new();
    for i in 0..20 {
        let submit_req = submit(&format!("c-{}", i), "gpt-4o-mini", webhook("https://x/h"));
        handles.push(broker.submit_request(submit_req));
    }
    let results = futures::future::join_all(handles).await;
    let batch_id = results[0].as_ref().unwrap().batch_id.clone();
    for result in &results {
        assert_eq!(result.as_ref().unwrap().batch_id, batch_id);
    }

    let batch = batches::get(&broker.db.pool, &batch_id).await.unwrap();
    assert_eq!(batch.request_count, 20);
}

#[tokio::test]
async fn rotate_by_count_promotes_full_batch() {
    let t = test_broker().await;

    let first = t
        .broker
        .submit_request(submit("a-1", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();

    // Simulate a full batch without inserting 50k rows
    sqlx::query("UPDATE batches SET request_count = ? WHERE id = ?")
        .bind(MAX_REQUESTS_PER_BATCH)
        .bind(&first.batch_id)
        .execute(&t.broker.db.pool)
        .await
        .unwrap();

    let second = t
        .broker
        .submit_request(submit("a-2", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();

    assert_ne!(second.batch_id, first.batch_id, "overflow lands in a new batch");
    let old = batches::get(&t.broker.db.pool, &first.batch_id).await.unwrap();
    assert_eq!(old.state().unwrap(), BatchState::Uploading);
    let new = batches::get(&t.broker.db.pool, &second.batch_id).await.unwrap();
    assert_eq!(new.state().unwrap(), BatchState::Building);
    assert_eq!(new.request_count, 1);
}

#[tokio::test]
async fn rotate_by_size_promotes_oversized_batch() {
    let t = test_broker().await;

    let first = t
        .broker
        .submit_request(submit("s-1", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();

    sqlx::query("UPDATE batches SET size_bytes = ? WHERE id = ?")
        .bind(MAX_BATCH_BYTES - 10)
        .bind(&first.batch_id)
        .execute(&t.broker.db.pool)
        .await
        .unwrap();

    let second = t
        .broker
        .submit_request(submit("s-2", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();
    assert_ne!(second.batch_id, first.batch_id);

    let old = batches::get(&t.broker.db.pool, &first.batch_id).await.unwrap();
    assert_eq!(old.state().unwrap(), BatchState::Uploading);
}

#[tokio::test]
async fn rotate_by_tokens_promotes_immediately() {
    // A queue limit this small makes any single request reach it
    let t = test_broker_custom(|config| {
        config.queue_limits.insert("tiny-model".to_string(), 1);
    })
    .await;

    let first = t
        .broker
        .submit_request(submit("t-1", "tiny-model", webhook("https://x/h")))
        .await
        .unwrap();

    let batch = batches::get(&t.broker.db.pool, &first.batch_id).await.unwrap();
    assert_eq!(
        batch.state().unwrap(),
        BatchState::Uploading,
        "token rotation promotes right after insert"
    );

    // Next submit opens a fresh building batch
    let second = t
        .broker
        .submit_request(submit("t-2", "tiny-model", webhook("https://x/h")))
        .await
        .unwrap();
    assert_ne!(second.batch_id, first.batch_id);
}

#[tokio::test]
async fn only_one_building_batch_per_key() {
    let t = test_broker().await;

    t.broker
        .submit_request(submit("k-1", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();
    t.broker
        .submit_request(submit("k-2", "gpt-4o", webhook("https://x/h")))
        .await
        .unwrap();
    t.broker
        .submit_request(submit("k-3", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM batches WHERE state = 'building' AND model = 'gpt-4o-mini'",
    )
    .fetch_one(&t.broker.db.pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM batches WHERE state = 'building'")
        .fetch_one(&t.broker.db.pool)
        .await
        .unwrap();
    assert_eq!(total, 2, "one building batch per (url, model)");
}

#[tokio::test]
async fn duplicate_custom_id_is_rejected() {
    let t = test_broker().await;

    t.broker
        .submit_request(submit("dup", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap();
    let err = t
        .broker
        .submit_request(submit("dup", "gpt-4o-mini", webhook("https://x/h")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("duplicate custom_id"), "{}", err);

    // The failed submit left no partial writes
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests")
        .fetch_one(&t.broker.db.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_write() {
    let t = test_broker().await;

    // Payload custom_id mismatch
    let mut bad = submit("x-1", "gpt-4o-mini", webhook("https://x/h"));
    bad.custom_id = "x-other".to_string();
    assert!(t.broker.submit_request(bad).await.is_err());

    // Bad delivery config
    let bad = submit("x-2", "gpt-4o-mini", DeliveryConfig::Webhook { url: "nope".to_string() });
    assert!(t.broker.submit_request(bad).await.is_err());

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM batches")
        .fetch_one(&t.broker.db.pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "validation failures never create rows");
}
