//! Restart recovery
//!
//! On process start, every non-terminal batch gets the trigger that drives
//! its state forward. All triggers are idempotent: each handler re-reads
//! the persisted row before acting, so re-enqueueing is always safe.

use crate::error::Result;
use crate::jobs::{JobKind, JobQueue};
use crate::models::Batch;
use crate::state::{BatchState, RequestState};
use crate::store::{batches, requests};
use sqlx::SqlitePool;

/// Re-enqueue work for everything that was in flight when the process
/// stopped. Returns the number of batches touched.
pub async fn recover(pool: &SqlitePool, jobs: &JobQueue) -> Result<usize> {
    let non_terminal = batches::list_non_terminal(pool).await?;
    let mut recovered = 0;

    for batch in &non_terminal {
        if recover_batch(pool, jobs, batch).await? {
            recovered += 1;
        }
    }

    if recovered > 0 {
        log::info!("Recovery re-enqueued work for {} batch(es)", recovered);
    }
    Ok(recovered)
}

async fn recover_batch(pool: &SqlitePool, jobs: &JobQueue, batch: &Batch) -> Result<bool> {
    let state = batch.state()?;
    match state {
        // The builder recreates its actor lazily; the stale sweep handles
        // abandoned building batches
        BatchState::Building => return Ok(false),
        BatchState::Uploading => {
            jobs.enqueue_batch(JobKind::Upload, &batch.id).await?;
        }
        BatchState::Uploaded => {
            jobs.enqueue_batch(JobKind::CreateProviderBatch, &batch.id).await?;
        }
        BatchState::WaitingForCapacity => {
            jobs.enqueue_global(JobKind::DispatchCapacity).await?;
        }
        BatchState::OpenaiProcessing => {
            jobs.enqueue_batch(JobKind::PollStatus, &batch.id).await?;
        }
        BatchState::OpenaiCompleted => {
            jobs.enqueue_batch(JobKind::DownloadResults, &batch.id).await?;
        }
        BatchState::Downloading => {
            jobs.enqueue_batch(JobKind::ProcessDownloadedFile, &batch.id).await?;
        }
        BatchState::ReadyToDeliver => {
            jobs.enqueue_batch(JobKind::StartDelivering, &batch.id).await?;
        }
        BatchState::Delivering => {
            recover_deliveries(pool, jobs, &batch.id).await?;
            jobs.enqueue_batch(JobKind::CheckDeliveryCompletion, &batch.id).await?;
        }
        BatchState::Expired => {
            jobs.enqueue_batch(JobKind::ProcessExpiredBatch, &batch.id).await?;
        }
        // Terminal states are filtered out by the query
        _ => return Ok(false),
    }
    Ok(true)
}

/// A crash mid-delivery leaves requests in `delivering` with no job alive.
/// Mark them failed (the attempt is lost) and requeue the undelivered rest.
async fn recover_deliveries(pool: &SqlitePool, jobs: &JobQueue, batch_id: &str) -> Result<()> {
    let stuck = requests::list_by_state(pool, batch_id, RequestState::Delivering).await?;
    for request in &stuck {
        let mut tx = pool.begin().await?;
        requests::transition(
            &mut tx,
            &request.id,
            RequestState::Delivering,
            RequestState::DeliveryFailed,
        )
        .await?;
        requests::transition(
            &mut tx,
            &request.id,
            RequestState::DeliveryFailed,
            RequestState::OpenaiProcessed,
        )
        .await?;
        tx.commit().await?;
    }

    let processed = requests::list_by_state(pool, batch_id, RequestState::OpenaiProcessed).await?;
    for request in &processed {
        jobs.enqueue_deliver(batch_id, &request.id).await?;
    }
    Ok(())
}
