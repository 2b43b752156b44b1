//! Periodic broker maintenance
//!
//! One background task ticks the recurring jobs:
//! - capacity dispatch every 30 s
//! - provider status poll sweep every 60 s (per-batch jobs, jittered)
//! - delivery completion sweep every 60 s
//! - stale building-batch expiry hourly
//! - expired-batch deletion hourly
//!
//! Runs until `stop()`; the loop owns nothing but Arc handles, so it can
//! be dropped with the process without cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::interval;

use crate::jobs::{JobKind, JobQueue};
use crate::services::workflow::Workflow;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DELIVERY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HOURLY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Spawns and controls the maintenance loop.
pub struct SchedulerService {
    workflow: Arc<Workflow>,
    jobs: JobQueue,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl SchedulerService {
    pub fn new(workflow: Arc<Workflow>, jobs: JobQueue) -> Self {
        Self { workflow, jobs, shutdown_tx: Mutex::new(None) }
    }

    /// Start the maintenance loop.
    pub async fn start(&self) {
        let mut guard = self.shutdown_tx.lock().await;
        if guard.is_some() {
            log::info!("Scheduler is already running");
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        *guard = Some(shutdown_tx);
        drop(guard);

        let workflow = Arc::clone(&self.workflow);
        let jobs = self.jobs.clone();

        log::info!("Starting scheduler");
        tokio::spawn(async move {
            let mut dispatch_timer = interval(DISPATCH_INTERVAL);
            let mut poll_timer = interval(POLL_SWEEP_INTERVAL);
            let mut delivery_timer = interval(DELIVERY_SWEEP_INTERVAL);
            let mut hourly_timer = interval(HOURLY_INTERVAL);

            // Skip the immediate first ticks
            dispatch_timer.tick().await;
            poll_timer.tick().await;
            delivery_timer.tick().await;
            hourly_timer.tick().await;

            loop {
                tokio::select! {
                    _ = dispatch_timer.tick() => {
                        if let Err(e) = jobs.enqueue_global(JobKind::DispatchCapacity).await {
                            log::warn!("Could not enqueue capacity dispatch: {}", e);
                        }
                    }
                    _ = poll_timer.tick() => {
                        if let Err(e) = workflow.sweep_poll_status().await {
                            log::warn!("Status poll sweep failed: {}", e);
                        }
                    }
                    _ = delivery_timer.tick() => {
                        if let Err(e) = workflow.sweep_delivery_completion().await {
                            log::warn!("Delivery completion sweep failed: {}", e);
                        }
                    }
                    _ = hourly_timer.tick() => {
                        match workflow.expire_stale_building().await {
                            Ok(n) if n > 0 => log::info!("Expired {} stale building batch(es)", n),
                            Ok(_) => {}
                            Err(e) => log::warn!("Stale building sweep failed: {}", e),
                        }
                        match workflow.delete_expired_batches().await {
                            Ok(n) if n > 0 => log::info!("Deleted {} expired batch(es)", n),
                            Ok(_) => {}
                            Err(e) => log::warn!("Expired batch sweep failed: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        log::info!("Scheduler received shutdown signal");
                        break;
                    }
                }
            }
            log::info!("Scheduler stopped");
        });
    }

    /// Stop the maintenance loop.
    pub async fn stop(&self) {
        let tx = {
            let mut guard = self.shutdown_tx.lock().await;
            guard.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}
