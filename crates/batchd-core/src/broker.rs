//! Broker assembly
//!
//! Wires the database, job queue, workflow engine, builder actors,
//! scheduler and event bus into one handle the daemon (and tests) drive.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::events::EventBus;
use crate::jobs::{default_queue_specs, JobQueue, JobRunner};
use crate::models::{Request, SubmitRequest};
use crate::provider::{OpenAiClient, ProviderClient};
use crate::services::admission::{ConfigCapacityProvider, HeuristicTokenEstimator};
use crate::services::builder::BatchBuilder;
use crate::services::delivery::DeliverySinks;
use crate::services::recovery;
use crate::services::scheduler::SchedulerService;
use crate::services::workflow::Workflow;

/// A running broker: submit requests through it, stop it on shutdown.
pub struct Broker {
    pub db: Database,
    pub jobs: JobQueue,
    pub events: EventBus,
    pub workflow: Arc<Workflow>,
    builder: Arc<BatchBuilder>,
    runner: JobRunner,
    scheduler: SchedulerService,
}

impl Broker {
    /// Build the broker against the real provider client.
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        let provider: Arc<dyn ProviderClient> = Arc::new(OpenAiClient::new(&config)?);
        Self::with_provider(config, provider).await
    }

    /// Build the broker with an injected provider (tests, staging stubs).
    pub async fn with_provider(
        config: BrokerConfig,
        provider: Arc<dyn ProviderClient>,
    ) -> Result<Self> {
        let db = Database::open(config.db_path.clone()).await?;
        let jobs = JobQueue::new(db.pool.clone());
        let events = EventBus::default();
        let capacity = Arc::new(ConfigCapacityProvider::new(config.clone()));
        let sinks = Arc::new(DeliverySinks::new(&config)?);

        let workflow = Arc::new(Workflow::new(
            db.pool.clone(),
            jobs.clone(),
            events.clone(),
            provider,
            capacity.clone(),
            sinks,
        ));

        let builder = Arc::new(BatchBuilder::new(
            db.pool.clone(),
            jobs.clone(),
            events.clone(),
            Arc::new(HeuristicTokenEstimator),
            capacity,
        ));

        let runner = JobRunner::new(jobs.clone(), workflow.clone());
        let scheduler = SchedulerService::new(workflow.clone(), jobs.clone());

        Ok(Self { db, jobs, events, workflow, builder, runner, scheduler })
    }

    /// Recover in-flight work, then start workers and the scheduler.
    pub async fn start(&self) -> Result<()> {
        let recovered = recovery::recover(&self.db.pool, &self.jobs).await?;
        log::info!("Broker starting ({} batch(es) recovered)", recovered);
        self.runner.start(default_queue_specs());
        self.scheduler.start().await;
        Ok(())
    }

    /// Submit one request into its `(url, model)` building batch.
    pub async fn submit_request(&self, submit: SubmitRequest) -> Result<Request> {
        self.builder.submit_request(submit).await
    }

    /// Stop workers and the scheduler. In-flight jobs finish; everything
    /// else resumes from the store on next start.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.runner.stop();
        log::info!("Broker shut down");
    }
}
