//! Batch workflow engine
//!
//! Drives every batch from `building` to a terminal state. Each step is a
//! job-queue handler keyed on `(kind, batch_id)`: it re-reads the row,
//! short-circuits when the batch has moved on, performs one transition
//! with its attribute mutations, and enqueues the next trigger. That makes
//! every handler safe under at-least-once invocation and restart.
//!
//! Step map:
//!   start_upload            building -> uploading
//!   upload                  uploading -> uploaded (renders + uploads JSONL)
//!   create_provider_batch   uploaded -> openai_processing | waiting_for_capacity
//!   poll_status             merges provider counters, dispatches on status
//!   download_results        openai_completed -> downloading
//!   process_downloaded_file downloading -> ready_to_deliver
//!   process_expired_batch   expired -> uploading | delivering | terminal
//!   start_delivering        ready_to_deliver -> delivering
//!   check_delivery_completion  delivering -> delivered | partially_delivered
//!                                           | delivery_failed

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;

use crate::config::{BUILDING_BATCH_STALE_AGE, TOKEN_LIMIT_RETRY_DELAYS_MIN};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::jobs::{Job, JobHandler, JobKind, JobQueue};
use crate::models::Batch;
use crate::provider::{cleanup_downloaded, ProviderBatch, ProviderClient, ProviderStatus};
use crate::services::admission::{self, AdmissionDecision, CapacityProvider};
use crate::services::delivery::{deliver_once, DeliverySinks};
use crate::services::reconciler::{self, FileKind};
use crate::state::{BatchState, RequestState};
use crate::store::{batches, requests};

/// Promote a `building` batch to `uploading` and schedule the upload.
/// Shared with the batch builder (rotation) and the stale sweep.
pub async fn start_upload(
    pool: &SqlitePool,
    jobs: &JobQueue,
    events: &EventBus,
    batch_id: &str,
) -> Result<()> {
    let batch = batches::get(pool, batch_id).await?;
    if batch.state()? != BatchState::Building {
        return Ok(());
    }
    if batch.request_count < 1 {
        return Err(Error::validation(format!(
            "batch {} has no requests to upload",
            batch_id
        )));
    }
    batches::transition_pool(pool, batch_id, BatchState::Building, BatchState::Uploading).await?;
    events.emit(batch_id, BatchState::Building, BatchState::Uploading);
    jobs.enqueue_batch(JobKind::Upload, batch_id).await?;
    Ok(())
}

/// The workflow engine: owns the handlers behind every job kind plus the
/// operator entry points (cancel, destroy, redeliver).
pub struct Workflow {
    pool: SqlitePool,
    jobs: JobQueue,
    events: EventBus,
    provider: Arc<dyn ProviderClient>,
    capacity: Arc<dyn CapacityProvider>,
    sinks: Arc<DeliverySinks>,
}

impl Workflow {
    pub fn new(
        pool: SqlitePool,
        jobs: JobQueue,
        events: EventBus,
        provider: Arc<dyn ProviderClient>,
        capacity: Arc<dyn CapacityProvider>,
        sinks: Arc<DeliverySinks>,
    ) -> Self {
        Self { pool, jobs, events, provider, capacity, sinks }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn capacity(&self) -> &Arc<dyn CapacityProvider> {
        &self.capacity
    }

    async fn transition_and_emit(
        &self,
        batch_id: &str,
        from: BatchState,
        to: BatchState,
    ) -> Result<()> {
        batches::transition_pool(&self.pool, batch_id, from, to).await?;
        self.events.emit(batch_id, from, to);
        Ok(())
    }

    // ========================================================================
    // upload
    // ========================================================================

    /// Render the batch to JSONL (one line per pending request, already
    /// canonical) and upload it to the provider.
    async fn upload(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::Uploading {
            return Ok(());
        }

        let pending =
            requests::list_by_state(&self.pool, batch_id, RequestState::Pending).await?;
        if pending.is_empty() {
            return Err(Error::validation(format!(
                "batch {} has no pending requests to upload",
                batch_id
            )));
        }

        let mut jsonl = String::with_capacity(
            pending.iter().map(|r| r.request_payload.len() + 1).sum(),
        );
        for request in &pending {
            jsonl.push_str(&request.request_payload);
            jsonl.push('\n');
        }

        log::info!(
            "Uploading batch {} ({} requests, {} bytes)",
            batch_id,
            pending.len(),
            jsonl.len()
        );
        let file_id = self.provider.upload_file(jsonl.into_bytes()).await?;

        let mut tx = self.pool.begin().await?;
        batches::set_input_file(&mut tx, batch_id, &file_id).await?;
        batches::transition(&mut tx, batch_id, BatchState::Uploading, BatchState::Uploaded).await?;
        tx.commit().await?;
        self.events.emit(batch_id, BatchState::Uploading, BatchState::Uploaded);

        self.jobs.enqueue_batch(JobKind::CreateProviderBatch, batch_id).await?;
        Ok(())
    }

    // ========================================================================
    // create_provider_batch (admission gate)
    // ========================================================================

    async fn create_provider_batch(&self, batch_id: &str) -> Result<()> {
        let mut batch = batches::get(&self.pool, batch_id).await?;
        let mut state = batch.state()?;

        // Resubmission path: the input file survived provider expiry, so
        // `uploading` is satisfied without a second upload.
        if state == BatchState::Uploading && batch.provider_input_file_id.is_some() {
            self.transition_and_emit(batch_id, BatchState::Uploading, BatchState::Uploaded)
                .await?;
            batch = batches::get(&self.pool, batch_id).await?;
            state = batch.state()?;
        }
        if state != BatchState::Uploaded {
            return Ok(());
        }

        match admission::check(&self.pool, self.capacity.as_ref(), &batch).await? {
            AdmissionDecision::Admit { limit, reserved, needed } => {
                log::info!(
                    "Admitting batch {} for {}: needs {} of {} free ({} reserved)",
                    batch_id,
                    batch.model,
                    needed,
                    limit,
                    reserved
                );
                self.submit_to_provider(&batch, BatchState::Uploaded).await
            }
            AdmissionDecision::WaitCapacityBlocked { reason, limit, reserved, needed } => {
                log::info!(
                    "Batch {} waits for capacity ({}): needs {}, limit {}, reserved {}",
                    batch_id,
                    reason,
                    needed,
                    limit,
                    reserved
                );
                let mut tx = self.pool.begin().await?;
                batches::transition(
                    &mut tx,
                    batch_id,
                    BatchState::Uploaded,
                    BatchState::WaitingForCapacity,
                )
                .await?;
                batches::stamp_waiting_for_capacity(&mut tx, batch_id, &reason).await?;
                tx.commit().await?;
                self.events
                    .emit(batch_id, BatchState::Uploaded, BatchState::WaitingForCapacity);
                Ok(())
            }
        }
    }

    /// Create the provider batch and move to `openai_processing`. `from` is
    /// `uploaded` on the direct path and `waiting_for_capacity` when the
    /// dispatcher promotes the batch.
    pub(crate) async fn submit_to_provider(&self, batch: &Batch, from: BatchState) -> Result<()> {
        let input_file_id = batch
            .provider_input_file_id
            .as_deref()
            .ok_or_else(|| Error::internal(format!("batch {} has no input file", batch.id)))?;

        let created = self
            .provider
            .create_batch(input_file_id, &batch.url, &batch.model)
            .await?;

        let mut tx = self.pool.begin().await?;
        batches::set_provider_batch(
            &mut tx,
            &batch.id,
            &created.provider_batch_id,
            created.expires_at,
        )
        .await?;
        batches::transition(&mut tx, &batch.id, from, BatchState::OpenaiProcessing).await?;
        requests::bulk_transition(
            &mut tx,
            &batch.id,
            RequestState::Pending,
            RequestState::OpenaiProcessing,
        )
        .await?;
        batches::reset_token_limit_backoff(&mut tx, &batch.id).await?;
        tx.commit().await?;
        self.events.emit(&batch.id, from, BatchState::OpenaiProcessing);

        log::info!(
            "Batch {} submitted to provider as {}",
            batch.id,
            created.provider_batch_id
        );
        self.jobs
            .enqueue_batch_after(JobKind::PollStatus, &batch.id, poll_jitter())
            .await?;
        Ok(())
    }

    // ========================================================================
    // poll_status
    // ========================================================================

    async fn poll_status(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::OpenaiProcessing {
            return Ok(());
        }
        let provider_batch_id = batch.provider_batch_id.as_deref().ok_or_else(|| {
            Error::internal(format!("batch {} is processing without a provider id", batch_id))
        })?;

        let snapshot = self.provider.get_batch(provider_batch_id).await?;

        // Merge counters and usage whatever the status
        let counts = snapshot.request_counts.unwrap_or_default();
        let usage = snapshot.usage.unwrap_or_default();
        let mut tx = self.pool.begin().await?;
        batches::merge_provider_poll(
            &mut tx,
            batch_id,
            counts.completed,
            counts.failed,
            counts.total,
            usage.input_tokens,
            usage.cached_tokens,
            usage.reasoning_tokens,
            usage.output_tokens,
        )
        .await?;
        tx.commit().await?;

        match ProviderStatus::parse(&snapshot.status) {
            Some(ProviderStatus::Validating)
            | Some(ProviderStatus::InProgress)
            | Some(ProviderStatus::Finalizing) => {
                log::debug!("Batch {} still {} at provider", batch_id, snapshot.status);
                Ok(())
            }
            Some(ProviderStatus::Completed) => self.handle_completed(&batch, &snapshot).await,
            Some(ProviderStatus::Failed) => {
                if snapshot.is_token_limit_exceeded() {
                    self.token_limit_retry(&batch, &snapshot).await
                } else {
                    self.fail_batch(&batch, &provider_error_text(&snapshot)).await
                }
            }
            Some(ProviderStatus::Expired) => self.handle_expired(&batch, &snapshot).await,
            Some(ProviderStatus::Cancelled) => {
                log::warn!("Provider reports batch {} cancelled; following", batch_id);
                let mut tx = self.pool.begin().await?;
                batches::transition(
                    &mut tx,
                    batch_id,
                    BatchState::OpenaiProcessing,
                    BatchState::Cancelled,
                )
                .await?;
                requests::cancel_non_terminal(&mut tx, batch_id).await?;
                tx.commit().await?;
                self.events
                    .emit(batch_id, BatchState::OpenaiProcessing, BatchState::Cancelled);
                Ok(())
            }
            None => {
                log::warn!(
                    "Unknown provider status {:?} for batch {}; will poll again",
                    snapshot.status,
                    batch_id
                );
                Ok(())
            }
        }
    }

    async fn handle_completed(&self, batch: &Batch, snapshot: &ProviderBatch) -> Result<()> {
        if snapshot.output_file_id.is_none() && snapshot.error_file_id.is_none() {
            return self
                .fail_batch(batch, "provider returned completed without any result file")
                .await;
        }

        let mut tx = self.pool.begin().await?;
        batches::set_output_files(
            &mut tx,
            &batch.id,
            snapshot.output_file_id.as_deref(),
            snapshot.error_file_id.as_deref(),
        )
        .await?;
        batches::transition(
            &mut tx,
            &batch.id,
            BatchState::OpenaiProcessing,
            BatchState::OpenaiCompleted,
        )
        .await?;
        tx.commit().await?;
        self.events
            .emit(&batch.id, BatchState::OpenaiProcessing, BatchState::OpenaiCompleted);

        self.jobs.enqueue_batch(JobKind::DownloadResults, &batch.id).await?;
        Ok(())
    }

    /// Provider hit its enqueued-token cap. Back off on a fixed schedule,
    /// reset every request to `pending`, and park the batch in
    /// `waiting_for_capacity` until the dispatcher retries it.
    async fn token_limit_retry(&self, batch: &Batch, snapshot: &ProviderBatch) -> Result<()> {
        let attempts = batch.token_limit_retry_attempts + 1;
        let error_text = provider_error_text(snapshot);

        if attempts as usize > TOKEN_LIMIT_RETRY_DELAYS_MIN.len() {
            return self
                .fail_batch(
                    batch,
                    &format!("token limit retries exhausted after {} attempts", attempts - 1),
                )
                .await;
        }

        let delay_minutes = TOKEN_LIMIT_RETRY_DELAYS_MIN[(attempts - 1) as usize];
        let next_at = Utc::now() + chrono::Duration::minutes(delay_minutes);
        log::warn!(
            "Batch {} hit the provider token limit (attempt {}); retrying after {} min",
            batch.id,
            attempts,
            delay_minutes
        );

        let mut tx = self.pool.begin().await?;
        requests::reset_for_token_limit_retry(&mut tx, &batch.id).await?;
        batches::set_token_limit_backoff(&mut tx, &batch.id, attempts, next_at, &error_text)
            .await?;
        batches::stamp_waiting_for_capacity(&mut tx, &batch.id, "token_limit_exceeded_backoff")
            .await?;
        batches::transition(
            &mut tx,
            &batch.id,
            BatchState::OpenaiProcessing,
            BatchState::WaitingForCapacity,
        )
        .await?;
        tx.commit().await?;
        self.events
            .emit(&batch.id, BatchState::OpenaiProcessing, BatchState::WaitingForCapacity);
        Ok(())
    }

    async fn handle_expired(&self, batch: &Batch, snapshot: &ProviderBatch) -> Result<()> {
        let has_partial =
            snapshot.output_file_id.is_some() || snapshot.error_file_id.is_some();

        if has_partial {
            log::info!("Batch {} expired with partial results", batch.id);
            let mut tx = self.pool.begin().await?;
            batches::set_output_files(
                &mut tx,
                &batch.id,
                snapshot.output_file_id.as_deref(),
                snapshot.error_file_id.as_deref(),
            )
            .await?;
            batches::transition(
                &mut tx,
                &batch.id,
                BatchState::OpenaiProcessing,
                BatchState::Expired,
            )
            .await?;
            tx.commit().await?;
            self.events
                .emit(&batch.id, BatchState::OpenaiProcessing, BatchState::Expired);
            self.jobs.enqueue_batch(JobKind::ProcessExpiredBatch, &batch.id).await?;
            return Ok(());
        }

        // Nothing came back: clear the provider handles (the input file
        // survives) and resubmit the whole batch.
        log::info!("Batch {} expired with no results; resubmitting", batch.id);
        let mut tx = self.pool.begin().await?;
        batches::clear_provider_ids(&mut tx, &batch.id).await?;
        requests::bulk_transition(
            &mut tx,
            &batch.id,
            RequestState::OpenaiProcessing,
            RequestState::Pending,
        )
        .await?;
        batches::transition(&mut tx, &batch.id, BatchState::OpenaiProcessing, BatchState::Expired)
            .await?;
        batches::transition(&mut tx, &batch.id, BatchState::Expired, BatchState::Uploading)
            .await?;
        tx.commit().await?;
        self.events.emit(&batch.id, BatchState::OpenaiProcessing, BatchState::Expired);
        self.events.emit(&batch.id, BatchState::Expired, BatchState::Uploading);

        self.jobs.enqueue_batch(JobKind::CreateProviderBatch, &batch.id).await?;
        Ok(())
    }

    async fn fail_batch(&self, batch: &Batch, error_msg: &str) -> Result<()> {
        let from = batch.state()?;
        log::error!("Batch {} failed: {}", batch.id, error_msg);
        let mut tx = self.pool.begin().await?;
        batches::set_error_msg(&mut tx, &batch.id, error_msg).await?;
        requests::fail_leftover_processing(&mut tx, &batch.id, error_msg).await?;
        batches::transition(&mut tx, &batch.id, from, BatchState::Failed).await?;
        tx.commit().await?;
        self.events.emit(&batch.id, from, BatchState::Failed);
        Ok(())
    }

    // ========================================================================
    // download + reconcile
    // ========================================================================

    async fn download_results(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::OpenaiCompleted {
            return Ok(());
        }
        self.transition_and_emit(batch_id, BatchState::OpenaiCompleted, BatchState::Downloading)
            .await?;
        self.jobs.enqueue_batch(JobKind::ProcessDownloadedFile, batch_id).await?;
        Ok(())
    }

    async fn process_downloaded_file(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::Downloading {
            return Ok(());
        }

        self.reconcile_files(&batch).await?;

        let mut tx = self.pool.begin().await?;
        requests::fail_leftover_processing(
            &mut tx,
            batch_id,
            "no result line returned by the provider",
        )
        .await?;
        batches::transition(&mut tx, batch_id, BatchState::Downloading, BatchState::ReadyToDeliver)
            .await?;
        tx.commit().await?;
        self.events.emit(batch_id, BatchState::Downloading, BatchState::ReadyToDeliver);

        self.jobs.enqueue_batch(JobKind::StartDelivering, batch_id).await?;
        Ok(())
    }

    /// Download and apply whichever result files exist.
    async fn reconcile_files(&self, batch: &Batch) -> Result<()> {
        if let Some(output_file_id) = batch.provider_output_file_id.as_deref() {
            let path = self.provider.download_file(output_file_id).await?;
            let result =
                reconciler::apply_result_file(&self.pool, &batch.id, &path, FileKind::Output).await;
            cleanup_downloaded(&path).await;
            result?;
        }
        if let Some(error_file_id) = batch.provider_error_file_id.as_deref() {
            let path = self.provider.download_file(error_file_id).await?;
            let result =
                reconciler::apply_result_file(&self.pool, &batch.id, &path, FileKind::Error).await;
            cleanup_downloaded(&path).await;
            result?;
        }
        Ok(())
    }

    /// Partial-expiration flow: apply whatever results exist, reset the
    /// unanswered requests to `pending`, and resubmit the remainder (or
    /// finalize when nothing is left to resubmit).
    async fn process_expired_batch(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::Expired {
            return Ok(());
        }

        self.reconcile_files(&batch).await?;

        let mut tx = self.pool.begin().await?;
        let reset = requests::reset_processing_to_pending(&mut tx, batch_id).await?;
        batches::clear_provider_ids(&mut tx, batch_id).await?;
        batches::clear_input_file(&mut tx, batch_id).await?;
        tx.commit().await?;

        if reset > 0 {
            log::info!(
                "Batch {} expired with {} unanswered requests; resubmitting them",
                batch_id,
                reset
            );
            self.transition_and_emit(batch_id, BatchState::Expired, BatchState::Uploading)
                .await?;
            self.jobs.enqueue_batch(JobKind::Upload, batch_id).await?;
            return Ok(());
        }

        // Everything got an answer; deliver the successes
        let processed =
            requests::list_by_state(&self.pool, batch_id, RequestState::OpenaiProcessed).await?;
        if processed.is_empty() {
            return self.finalize(batch_id, BatchState::Expired).await;
        }
        self.transition_and_emit(batch_id, BatchState::Expired, BatchState::Delivering)
            .await?;
        for request in &processed {
            self.jobs.enqueue_deliver(batch_id, &request.id).await?;
        }
        self.jobs
            .enqueue_batch_after(JobKind::CheckDeliveryCompletion, batch_id, Duration::from_secs(10))
            .await?;
        Ok(())
    }

    // ========================================================================
    // delivery
    // ========================================================================

    async fn start_delivering(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::ReadyToDeliver {
            return Ok(());
        }
        self.transition_and_emit(batch_id, BatchState::ReadyToDeliver, BatchState::Delivering)
            .await?;

        let processed =
            requests::list_by_state(&self.pool, batch_id, RequestState::OpenaiProcessed).await?;
        log::info!("Delivering batch {}: {} requests", batch_id, processed.len());
        for request in &processed {
            self.jobs.enqueue_deliver(batch_id, &request.id).await?;
        }
        self.jobs
            .enqueue_batch_after(JobKind::CheckDeliveryCompletion, batch_id, Duration::from_secs(10))
            .await?;
        Ok(())
    }

    /// One queued delivery attempt. Earlier failed attempts leave the
    /// request in `delivery_failed`; a retrying job first moves it back
    /// through `retry_delivery`.
    async fn deliver(&self, job: &Job) -> Result<()> {
        let request_id = job
            .request_id
            .as_deref()
            .ok_or_else(|| Error::internal("deliver job without request_id"))?;
        let request = match requests::get(&self.pool, request_id).await {
            Ok(request) => request,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let state = request.state()?;
        let request = match state {
            RequestState::OpenaiProcessed => request,
            // A prior attempt of this same job failed or crashed
            RequestState::DeliveryFailed if job.attempts > 1 => {
                requests::transition_pool(
                    &self.pool,
                    request_id,
                    RequestState::DeliveryFailed,
                    RequestState::OpenaiProcessed,
                )
                .await?;
                requests::get(&self.pool, request_id).await?
            }
            RequestState::Delivering if job.attempts > 1 => {
                requests::transition_pool(
                    &self.pool,
                    request_id,
                    RequestState::Delivering,
                    RequestState::DeliveryFailed,
                )
                .await?;
                requests::transition_pool(
                    &self.pool,
                    request_id,
                    RequestState::DeliveryFailed,
                    RequestState::OpenaiProcessed,
                )
                .await?;
                requests::get(&self.pool, request_id).await?
            }
            // Cancelled, delivered elsewhere, or reset by a token-limit
            // retry: nothing to deliver
            _ => {
                log::debug!("Skipping delivery for request {} in state {}", request_id, state);
                return Ok(());
            }
        };

        let result = deliver_once(&self.pool, &self.sinks, &request).await;

        if result.is_ok() {
            self.maybe_trigger_completion(&request.batch_id).await?;
        }
        result.map(|_| ())
    }

    async fn maybe_trigger_completion(&self, batch_id: &str) -> Result<()> {
        if requests::all_terminal(&self.pool, batch_id).await? {
            self.jobs.enqueue_batch(JobKind::CheckDeliveryCompletion, batch_id).await?;
        }
        Ok(())
    }

    async fn check_delivery_completion(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        if batch.state()? != BatchState::Delivering {
            return Ok(());
        }
        if !requests::all_terminal(&self.pool, batch_id).await? {
            return Ok(());
        }
        self.finalize(batch_id, BatchState::Delivering).await
    }

    /// Terminal accounting: all delivered, none delivered, or a mix. A
    /// batch with zero requests counts as delivered.
    async fn finalize(&self, batch_id: &str, from: BatchState) -> Result<()> {
        let counts = batches::request_state_counts(&self.pool, batch_id).await?;
        let total = counts.total();
        let delivered = counts.get("delivered");

        let to = if total == 0 || delivered == total {
            BatchState::Delivered
        } else if delivered == 0 {
            BatchState::DeliveryFailed
        } else {
            BatchState::PartiallyDelivered
        };

        log::info!(
            "Finalizing batch {}: {}/{} delivered -> {}",
            batch_id,
            delivered,
            total,
            to
        );
        self.transition_and_emit(batch_id, from, to).await?;

        // Freed capacity: let waiting batches try immediately
        self.jobs.enqueue_global(JobKind::DispatchCapacity).await?;
        Ok(())
    }

    // ========================================================================
    // sweeps
    // ========================================================================

    /// Hourly: promote stale building batches, destroy empty ones.
    pub async fn expire_stale_building(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(BUILDING_BATCH_STALE_AGE).unwrap_or_default();
        let stale = batches::list_stale_building(&self.pool, cutoff).await?;
        let mut handled = 0;
        for batch in stale {
            if batch.request_count == 0 {
                log::info!("Destroying empty stale building batch {}", batch.id);
                batches::delete(&self.pool, &batch.id).await?;
            } else {
                log::info!("Promoting stale building batch {}", batch.id);
                if let Err(e) = start_upload(&self.pool, &self.jobs, &self.events, &batch.id).await
                {
                    log::warn!("Could not promote stale batch {}: {}", batch.id, e);
                    continue;
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Hourly: drop batches past their retention window, provider files
    /// included (best effort).
    pub async fn delete_expired_batches(&self) -> Result<usize> {
        let expired = batches::list_expired(&self.pool, Utc::now()).await?;
        let mut deleted = 0;
        for batch in expired {
            let state = batch.state()?;
            if !state.is_terminal() {
                continue;
            }
            log::info!("Deleting expired batch {} ({})", batch.id, state);
            self.destroy_batch(&batch.id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Enqueue status polls for every batch the provider is working on.
    pub async fn sweep_poll_status(&self) -> Result<()> {
        for batch in batches::list_by_state(&self.pool, BatchState::OpenaiProcessing).await? {
            self.jobs
                .enqueue_batch_after(JobKind::PollStatus, &batch.id, poll_jitter())
                .await?;
        }
        Ok(())
    }

    /// Enqueue completion checks for every delivering batch.
    pub async fn sweep_delivery_completion(&self) -> Result<()> {
        for batch in batches::list_by_state(&self.pool, BatchState::Delivering).await? {
            self.jobs.enqueue_batch(JobKind::CheckDeliveryCompletion, &batch.id).await?;
        }
        Ok(())
    }

    // ========================================================================
    // operator actions
    // ========================================================================

    /// Cancel a batch from any non-terminal state. Aborts when the
    /// provider-side cancel fails with anything but 404.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        let state = batch.state()?;
        if state.is_terminal() {
            return Err(Error::validation(format!(
                "batch {} is already {}",
                batch_id, state
            )));
        }

        if state == BatchState::OpenaiProcessing {
            if let Some(provider_batch_id) = batch.provider_batch_id.as_deref() {
                match self.provider.cancel_batch(provider_batch_id).await {
                    Ok(()) => {}
                    // The provider already forgot the batch
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.jobs.cancel_by_tag(batch_id).await?;

        let mut tx = self.pool.begin().await?;
        batches::transition(&mut tx, batch_id, state, BatchState::Cancelled).await?;
        requests::cancel_non_terminal(&mut tx, batch_id).await?;
        tx.commit().await?;
        self.events.emit(batch_id, state, BatchState::Cancelled);
        log::info!("Cancelled batch {}", batch_id);
        Ok(())
    }

    /// Delete a batch outright: provider-side cancel and file deletion
    /// best-effort, then the row (requests, transitions and attempts
    /// cascade).
    pub async fn destroy_batch(&self, batch_id: &str) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        self.jobs.cancel_by_tag(batch_id).await?;

        if batch.state()? == BatchState::OpenaiProcessing {
            if let Some(provider_batch_id) = batch.provider_batch_id.as_deref() {
                match self.provider.cancel_batch(provider_batch_id).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => {
                        log::warn!("Could not cancel provider batch {}: {}", provider_batch_id, e)
                    }
                }
            }
        }

        for file_id in [
            batch.provider_input_file_id.as_deref(),
            batch.provider_output_file_id.as_deref(),
            batch.provider_error_file_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            match self.provider.delete_file(file_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => log::warn!("Could not delete provider file {}: {}", file_id, e),
            }
        }

        batches::delete(&self.pool, batch_id).await?;
        log::info!("Destroyed batch {}", batch_id);
        Ok(())
    }

    /// Operator redeliver: push every non-delivered (and optionally every
    /// delivered) request through delivery again. Sinks are expected to be
    /// idempotent on custom_id.
    pub async fn redeliver(&self, batch_id: &str, include_delivered: bool) -> Result<()> {
        let batch = batches::get(&self.pool, batch_id).await?;
        let state = batch.state()?;
        if !matches!(
            state,
            BatchState::Delivered | BatchState::PartiallyDelivered | BatchState::DeliveryFailed
        ) {
            return Err(Error::validation(format!(
                "batch {} is {}, redeliver needs a finished delivery state",
                batch_id, state
            )));
        }

        let mut tx = self.pool.begin().await?;
        requests::bulk_transition(
            &mut tx,
            batch_id,
            RequestState::DeliveryFailed,
            RequestState::OpenaiProcessed,
        )
        .await?;
        if include_delivered {
            requests::bulk_transition(
                &mut tx,
                batch_id,
                RequestState::Delivered,
                RequestState::OpenaiProcessed,
            )
            .await?;
        }
        batches::transition(&mut tx, batch_id, state, BatchState::Delivering).await?;
        tx.commit().await?;
        self.events.emit(batch_id, state, BatchState::Delivering);

        let processed =
            requests::list_by_state(&self.pool, batch_id, RequestState::OpenaiProcessed).await?;
        log::info!("Redelivering batch {}: {} requests", batch_id, processed.len());
        for request in &processed {
            self.jobs.enqueue_deliver(batch_id, &request.id).await?;
        }
        self.jobs
            .enqueue_batch_after(JobKind::CheckDeliveryCompletion, batch_id, Duration::from_secs(10))
            .await?;
        Ok(())
    }
}

/// Per-batch poll delay: around a minute, jittered so polls spread out.
fn poll_jitter() -> Duration {
    Duration::from_secs(55 + rand::thread_rng().gen_range(0..10))
}

fn provider_error_text(snapshot: &ProviderBatch) -> String {
    if snapshot.errors.is_empty() {
        return format!("provider batch {}", snapshot.status);
    }
    snapshot
        .errors
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.code.as_deref().unwrap_or("unknown"),
                e.message.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Job dispatch
// ============================================================================

#[async_trait::async_trait]
impl JobHandler for Workflow {
    async fn handle(&self, job: &Job) -> Result<()> {
        let kind = job.kind()?;
        if kind == JobKind::DispatchCapacity {
            return crate::services::dispatcher::dispatch_all(self).await.map(|_| ());
        }
        if kind == JobKind::Deliver {
            return self.deliver(job).await;
        }

        let batch_id = job
            .batch_id
            .as_deref()
            .ok_or_else(|| Error::internal(format!("{} job without batch_id", kind)))?;
        // A destroyed batch obsoletes its jobs
        if let Err(Error::NotFound(_)) = batches::get(&self.pool, batch_id).await {
            return Ok(());
        }

        match kind {
            JobKind::Upload => self.upload(batch_id).await,
            JobKind::CreateProviderBatch => self.create_provider_batch(batch_id).await,
            JobKind::PollStatus => self.poll_status(batch_id).await,
            JobKind::DownloadResults => self.download_results(batch_id).await,
            JobKind::ProcessDownloadedFile => self.process_downloaded_file(batch_id).await,
            JobKind::ProcessExpiredBatch => self.process_expired_batch(batch_id).await,
            JobKind::StartDelivering => self.start_delivering(batch_id).await,
            JobKind::CheckDeliveryCompletion => self.check_delivery_completion(batch_id).await,
            JobKind::Deliver | JobKind::DispatchCapacity => unreachable!("handled above"),
        }
    }

    /// The queue gave up on a job: surface the step's failure transition.
    async fn on_exhausted(&self, job: &Job, error: &Error) {
        let kind = match job.kind() {
            Ok(kind) => kind,
            Err(_) => return,
        };

        match kind {
            JobKind::Deliver => {
                let Some(request_id) = job.request_id.as_deref() else { return };
                let Ok(request) = requests::get(&self.pool, request_id).await else { return };
                if request.state().ok() == Some(RequestState::Delivering) {
                    if let Err(e) = requests::transition_pool(
                        &self.pool,
                        request_id,
                        RequestState::Delivering,
                        RequestState::DeliveryFailed,
                    )
                    .await
                    {
                        log::warn!("Could not fail delivery for {}: {}", request_id, e);
                    }
                }
                if let Err(e) = self.maybe_trigger_completion(&request.batch_id).await {
                    log::warn!("Completion check failed for {}: {}", request.batch_id, e);
                }
            }
            JobKind::Upload
            | JobKind::CreateProviderBatch
            | JobKind::PollStatus
            | JobKind::DownloadResults
            | JobKind::ProcessDownloadedFile
            | JobKind::ProcessExpiredBatch => {
                let Some(batch_id) = job.batch_id.as_deref() else { return };
                let Ok(batch) = batches::get(&self.pool, batch_id).await else { return };
                let Ok(state) = batch.state() else { return };
                if state.is_terminal() || state == BatchState::Building {
                    return;
                }
                let msg = format!("{} exhausted its retries: {}", kind, error);
                if let Err(e) = self.fail_batch(&batch, &msg).await {
                    log::error!("Could not fail batch {}: {}", batch_id, e);
                }
            }
            JobKind::StartDelivering | JobKind::CheckDeliveryCompletion
            | JobKind::DispatchCapacity => {
                // Sweeps re-enqueue these; nothing to surface
                log::warn!("Job {} ({}) exhausted retries: {}", job.id, kind, error);
            }
        }
    }
}
