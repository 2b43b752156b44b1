//! Durable job queue
//!
//! Work scheduling for the batch workflow lives in the `jobs` table:
//! - enqueue-with-deduplication via a partial unique index on `unique_key`
//!   (at most one live job per `(kind, batch_id)` / `(deliver, request_id)`)
//! - scheduled execution via `run_at`
//! - bounded retries with linear backoff plus jitter
//! - cancel-by-tag (tag = batch id)
//! - an on-exhaustion hook so each step can surface its failure transition
//!
//! Queues and concurrency:
//! - `batch_uploads`: several batches in parallel, one job per batch
//! - `batch_processing`: concurrency 1, serializes large file I/O
//! - `default`: sweeps, polls, capacity dispatch
//! - `delivery`: one HTTP/AMQP call per job, high concurrency

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::config::DELIVERY_MAX_ATTEMPTS;
use crate::error::{Error, Result};

/// Default bounded attempts for non-delivery jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Linear backoff base between retries.
const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(10);

// ============================================================================
// Job kinds and queues
// ============================================================================

/// Every trigger the workflow schedules through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Upload,
    CreateProviderBatch,
    PollStatus,
    DownloadResults,
    ProcessDownloadedFile,
    ProcessExpiredBatch,
    StartDelivering,
    Deliver,
    CheckDeliveryCompletion,
    DispatchCapacity,
}

impl JobKind {
    pub const ALL: [JobKind; 10] = [
        JobKind::Upload,
        JobKind::CreateProviderBatch,
        JobKind::PollStatus,
        JobKind::DownloadResults,
        JobKind::ProcessDownloadedFile,
        JobKind::ProcessExpiredBatch,
        JobKind::StartDelivering,
        JobKind::Deliver,
        JobKind::CheckDeliveryCompletion,
        JobKind::DispatchCapacity,
    ];

    /// Which worker queue this kind runs on.
    pub fn queue(self) -> &'static str {
        match self {
            JobKind::Upload => "batch_uploads",
            JobKind::DownloadResults
            | JobKind::ProcessDownloadedFile
            | JobKind::ProcessExpiredBatch => "batch_processing",
            JobKind::Deliver => "delivery",
            _ => "default",
        }
    }

    pub fn max_attempts(self) -> i32 {
        match self {
            JobKind::Deliver => DELIVERY_MAX_ATTEMPTS,
            _ => DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Upload => "upload",
            JobKind::CreateProviderBatch => "create_provider_batch",
            JobKind::PollStatus => "poll_status",
            JobKind::DownloadResults => "download_results",
            JobKind::ProcessDownloadedFile => "process_downloaded_file",
            JobKind::ProcessExpiredBatch => "process_expired_batch",
            JobKind::StartDelivering => "start_delivering",
            JobKind::Deliver => "deliver",
            JobKind::CheckDeliveryCompletion => "check_delivery_completion",
            JobKind::DispatchCapacity => "dispatch_capacity",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "upload" => Ok(JobKind::Upload),
            "create_provider_batch" => Ok(JobKind::CreateProviderBatch),
            "poll_status" => Ok(JobKind::PollStatus),
            "download_results" => Ok(JobKind::DownloadResults),
            "process_downloaded_file" => Ok(JobKind::ProcessDownloadedFile),
            "process_expired_batch" => Ok(JobKind::ProcessExpiredBatch),
            "start_delivering" => Ok(JobKind::StartDelivering),
            "deliver" => Ok(JobKind::Deliver),
            "check_delivery_completion" => Ok(JobKind::CheckDeliveryCompletion),
            "dispatch_capacity" => Ok(JobKind::DispatchCapacity),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub batch_id: Option<String>,
    pub request_id: Option<String>,
    pub unique_key: Option<String>,
    pub tag: Option<String>,
    pub state: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn kind(&self) -> Result<JobKind> {
        JobKind::from_str(&self.kind).map_err(Error::internal)
    }
}

// ============================================================================
// Queue operations
// ============================================================================

/// Handle for enqueueing and administering jobs.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a batch-scoped job. Returns false when an equivalent live
    /// job already exists (deduplicated).
    pub async fn enqueue_batch(&self, kind: JobKind, batch_id: &str) -> Result<bool> {
        self.enqueue_batch_after(kind, batch_id, Duration::ZERO).await
    }

    /// Enqueue a batch-scoped job to run after a delay.
    pub async fn enqueue_batch_after(
        &self,
        kind: JobKind,
        batch_id: &str,
        delay: Duration,
    ) -> Result<bool> {
        let unique_key = format!("{}:{}", kind, batch_id);
        self.insert(kind, Some(batch_id), None, &unique_key, Some(batch_id), delay)
            .await
    }

    /// Enqueue a process-wide job (capacity dispatch); one live instance
    /// at a time.
    pub async fn enqueue_global(&self, kind: JobKind) -> Result<bool> {
        let unique_key = format!("{}:global", kind);
        self.insert(kind, None, None, &unique_key, None, Duration::ZERO).await
    }

    /// Enqueue a delivery job for one request.
    pub async fn enqueue_deliver(&self, batch_id: &str, request_id: &str) -> Result<bool> {
        let unique_key = format!("deliver:{}", request_id);
        self.insert(
            JobKind::Deliver,
            Some(batch_id),
            Some(request_id),
            &unique_key,
            Some(batch_id),
            Duration::ZERO,
        )
        .await
    }

    async fn insert(
        &self,
        kind: JobKind,
        batch_id: Option<&str>,
        request_id: Option<&str>,
        unique_key: &str,
        tag: Option<&str>,
        delay: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        // INSERT OR IGNORE rides the partial unique index: a live job with
        // the same unique_key makes this a no-op.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, queue, kind, batch_id, request_id, unique_key, tag,
                 state, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind.queue())
        .bind(kind.to_string())
        .bind(batch_id)
        .bind(request_id)
        .bind(unique_key)
        .bind(tag)
        .bind(kind.max_attempts())
        .bind(run_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cancel all pending jobs tagged with a batch id. Running jobs keep
    /// going and short-circuit on their next state read.
    pub async fn cancel_by_tag(&self, tag: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'cancelled', updated_at = ? WHERE tag = ? AND state = 'pending'",
        )
        .bind(Utc::now())
        .bind(tag)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Claim up to `limit` due jobs from a queue, flipping them to
    /// `running` and bumping `attempts`.
    pub async fn claim_due(&self, queue: &str, limit: i64) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let due: Vec<Job> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE queue = ? AND state = 'pending' AND run_at <= ?
            ORDER BY run_at ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'running', attempts = attempts + 1, updated_at = ? \
                 WHERE id = ? AND state = 'pending'",
            )
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                job.state = "running".to_string();
                job.attempts += 1;
                claimed.push(job);
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    /// Mark a job done.
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'done', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed run. Transient errors retry with linear backoff
    /// until attempts are exhausted; deterministic errors fail immediately.
    /// Returns true when the job is exhausted (the caller fires the
    /// on-exhaustion hook).
    pub async fn fail(&self, job: &Job, error: &Error) -> Result<bool> {
        let exhausted = !error.is_transient() || job.attempts >= job.max_attempts;
        if exhausted {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(error.to_string())
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }

        let backoff = retry_backoff(job.attempts);
        let run_at = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
        sqlx::query(
            "UPDATE jobs SET state = 'pending', last_error = ?, run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error.to_string())
        .bind(run_at)
        .bind(Utc::now())
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    /// Live (pending or running) job count, for tests and the CLI.
    pub async fn live_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'running')")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Pending jobs of a kind, for tests and the CLI.
    pub async fn pending_of_kind(&self, kind: JobKind) -> Result<Vec<Job>> {
        let rows = sqlx::query_as(
            "SELECT * FROM jobs WHERE kind = ? AND state = 'pending' ORDER BY run_at ASC",
        )
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Linear backoff with a little jitter so retries spread out.
fn retry_backoff(attempts: i64) -> Duration {
    let base = RETRY_BACKOFF_BASE * attempts.max(1) as u32;
    let jitter = rand::thread_rng().gen_range(0..5_000);
    base + Duration::from_millis(jitter)
}

// ============================================================================
// Worker runner
// ============================================================================

/// Implemented by the workflow layer: executes one job, and surfaces the
/// step's failure transition when the queue gives up on it.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<()>;

    /// Called once after the final failed attempt.
    async fn on_exhausted(&self, job: &Job, error: &Error);
}

/// Per-queue worker configuration.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: &'static str,
    pub concurrency: usize,
}

/// The standard queue topology.
pub fn default_queue_specs() -> Vec<QueueSpec> {
    vec![
        QueueSpec { name: "batch_uploads", concurrency: 4 },
        QueueSpec { name: "batch_processing", concurrency: 1 },
        QueueSpec { name: "default", concurrency: 4 },
        QueueSpec { name: "delivery", concurrency: 16 },
    ]
}

/// Spawns one polling loop per queue and runs claimed jobs through the
/// handler, bounded by the queue's concurrency.
pub struct JobRunner {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobRunner {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { queue, handler, shutdown_tx }
    }

    /// Start the worker loops.
    pub fn start(&self, specs: Vec<QueueSpec>) {
        for spec in specs {
            let queue = self.queue.clone();
            let handler = Arc::clone(&self.handler);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let semaphore = Arc::new(Semaphore::new(spec.concurrency));

            tokio::spawn(async move {
                let mut timer = tokio::time::interval(Duration::from_millis(500));
                log::info!(
                    "Job queue worker started: {} (concurrency {})",
                    spec.name,
                    spec.concurrency
                );
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            let free = semaphore.available_permits();
                            if free == 0 {
                                continue;
                            }
                            let jobs = match queue.claim_due(spec.name, free as i64).await {
                                Ok(jobs) => jobs,
                                Err(e) => {
                                    log::warn!("Job claim failed on {}: {}", spec.name, e);
                                    continue;
                                }
                            };
                            for job in jobs {
                                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                                    Ok(p) => p,
                                    Err(_) => break,
                                };
                                let queue = queue.clone();
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    run_one(&queue, handler.as_ref(), &job).await;
                                });
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                log::info!("Job queue worker stopping: {}", spec.name);
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Signal every worker loop to stop after its current jobs.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_one(queue: &JobQueue, handler: &dyn JobHandler, job: &Job) {
    match handler.handle(job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(&job.id).await {
                log::warn!("Failed to complete job {}: {}", job.id, e);
            }
        }
        Err(error) => {
            log::warn!(
                "Job {} ({}, attempt {}/{}) failed: {}",
                job.id,
                job.kind,
                job.attempts,
                job.max_attempts,
                error
            );
            match queue.fail(job, &error).await {
                Ok(true) => handler.on_exhausted(job, &error).await,
                Ok(false) => {}
                Err(e) => log::warn!("Failed to record job failure {}: {}", job.id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_queue() -> (JobQueue, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();
        (JobQueue::new(db.pool), dir)
    }

    #[test]
    fn test_kind_roundtrip_and_queues() {
        for kind in JobKind::ALL {
            assert_eq!(kind.to_string().parse::<JobKind>().unwrap(), kind);
        }
        assert_eq!(JobKind::Upload.queue(), "batch_uploads");
        assert_eq!(JobKind::ProcessDownloadedFile.queue(), "batch_processing");
        assert_eq!(JobKind::Deliver.queue(), "delivery");
        assert_eq!(JobKind::PollStatus.queue(), "default");
        assert_eq!(JobKind::Deliver.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let (queue, _dir) = test_queue().await;
        assert!(queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap());
        assert!(!queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap());
        // Different batch or kind is a different key
        assert!(queue.enqueue_batch(JobKind::Upload, "b2").await.unwrap());
        assert!(queue.enqueue_batch(JobKind::PollStatus, "b1").await.unwrap());
        assert_eq!(queue.live_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_runs_and_completes() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap();

        let claimed = queue.claim_due("batch_uploads", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // Running jobs are not claimable again
        assert!(queue.claim_due("batch_uploads", 10).await.unwrap().is_empty());

        queue.complete(&claimed[0].id).await.unwrap();
        assert_eq!(queue.live_count().await.unwrap(), 0);

        // Once done, the unique key is free again
        assert!(queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_scheduled_jobs_not_due_yet() {
        let (queue, _dir) = test_queue().await;
        queue
            .enqueue_batch_after(JobKind::PollStatus, "b1", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(queue.claim_due("default", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_retries_then_exhausts() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue_deliver("b1", "r1").await.unwrap();

        let job = queue.claim_due("delivery", 1).await.unwrap().remove(0);
        let transient = Error::Io(std::io::Error::other("net down"));

        // attempts 1 and 2 reschedule, attempt 3 exhausts (max_attempts 3)
        assert!(!queue.fail(&job, &transient).await.unwrap());
        let job = loop {
            // rescheduled with backoff; pull it regardless of run_at
            sqlx::query("UPDATE jobs SET run_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(&job.id)
                .execute(&queue.pool)
                .await
                .unwrap();
            let mut claimed = queue.claim_due("delivery", 1).await.unwrap();
            if let Some(j) = claimed.pop() {
                break j;
            }
        };
        assert_eq!(job.attempts, 2);
        assert!(!queue.fail(&job, &transient).await.unwrap());

        sqlx::query("UPDATE jobs SET run_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&job.id)
            .execute(&queue.pool)
            .await
            .unwrap();
        let job = queue.claim_due("delivery", 1).await.unwrap().remove(0);
        assert_eq!(job.attempts, 3);
        assert!(queue.fail(&job, &transient).await.unwrap());
    }

    #[tokio::test]
    async fn test_deterministic_error_exhausts_immediately() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap();
        let job = queue.claim_due("batch_uploads", 1).await.unwrap().remove(0);
        let validation = Error::validation("bad payload");
        assert!(queue.fail(&job, &validation).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_by_tag() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue_batch(JobKind::Upload, "b1").await.unwrap();
        queue.enqueue_batch(JobKind::PollStatus, "b1").await.unwrap();
        queue.enqueue_batch(JobKind::Upload, "b2").await.unwrap();

        let cancelled = queue.cancel_by_tag("b1").await.unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(queue.live_count().await.unwrap(), 1);
    }

    #[test]
    fn test_retry_backoff_is_linear() {
        let b1 = retry_backoff(1);
        let b3 = retry_backoff(3);
        assert!(b1 >= Duration::from_secs(10) && b1 < Duration::from_secs(15));
        assert!(b3 >= Duration::from_secs(30) && b3 < Duration::from_secs(35));
    }
}
