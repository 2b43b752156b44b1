//! Batch builder
//!
//! One long-lived actor per `(url, model)` absorbs submissions into the
//! current `building` batch and rotates it when a limit is hit. The actor
//! serializes `add_request` for its key, so concurrent submits for the
//! same endpoint/model pair are linearized; the registry lazily respawns
//! an actor that died.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::{MAX_BATCH_BYTES, MAX_REQUESTS_PER_BATCH};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::jobs::JobQueue;
use crate::models::{Batch, Request, SubmitRequest};
use crate::services::admission::{CapacityProvider, TokenEstimator};
use crate::services::workflow;
use crate::store::{batches, requests};

/// Depth of each actor's mailbox; submits beyond it apply backpressure.
const ACTOR_MAILBOX: usize = 64;

enum BuilderMsg {
    Add {
        submit: SubmitRequest,
        reply: oneshot::Sender<Result<Request>>,
    },
}

/// Process-wide registry of per-`(url, model)` builder actors.
pub struct BatchBuilder {
    pool: SqlitePool,
    jobs: JobQueue,
    events: EventBus,
    estimator: Arc<dyn TokenEstimator>,
    capacity: Arc<dyn CapacityProvider>,
    actors: Mutex<HashMap<(String, String), mpsc::Sender<BuilderMsg>>>,
}

impl BatchBuilder {
    pub fn new(
        pool: SqlitePool,
        jobs: JobQueue,
        events: EventBus,
        estimator: Arc<dyn TokenEstimator>,
        capacity: Arc<dyn CapacityProvider>,
    ) -> Self {
        Self {
            pool,
            jobs,
            events,
            estimator,
            capacity,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Submit one request. Validates, routes to the key's actor, and waits
    /// for the persisted row. All errors surface to the caller; no partial
    /// writes remain.
    pub async fn submit_request(self: &Arc<Self>, submit: SubmitRequest) -> Result<Request> {
        submit.validate()?;

        // One respawn if the actor died since we looked it up.
        for _ in 0..2 {
            let sender = self.actor_for(&submit.url, &submit.model).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let msg = BuilderMsg::Add { submit: submit.clone(), reply: reply_tx };

            if sender.send(msg).await.is_err() {
                self.remove_actor(&submit.url, &submit.model).await;
                continue;
            }
            match reply_rx.await {
                Ok(result) => return result,
                Err(_) => {
                    // Actor crashed mid-request; the transaction rolled back.
                    self.remove_actor(&submit.url, &submit.model).await;
                    continue;
                }
            }
        }
        Err(Error::internal("batch builder actor unavailable"))
    }

    async fn actor_for(&self, url: &str, model: &str) -> mpsc::Sender<BuilderMsg> {
        let key = (url.to_string(), model.to_string());
        let mut actors = self.actors.lock().await;
        if let Some(sender) = actors.get(&key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(ACTOR_MAILBOX);
        let worker = ActorState {
            pool: self.pool.clone(),
            jobs: self.jobs.clone(),
            events: self.events.clone(),
            estimator: Arc::clone(&self.estimator),
            capacity: Arc::clone(&self.capacity),
        };
        log::debug!("Spawning batch builder actor for ({}, {})", url, model);
        tokio::spawn(actor_loop(worker, rx));
        actors.insert(key, tx.clone());
        tx
    }

    async fn remove_actor(&self, url: &str, model: &str) {
        let key = (url.to_string(), model.to_string());
        self.actors.lock().await.remove(&key);
    }
}

struct ActorState {
    pool: SqlitePool,
    jobs: JobQueue,
    events: EventBus,
    estimator: Arc<dyn TokenEstimator>,
    capacity: Arc<dyn CapacityProvider>,
}

async fn actor_loop(state: ActorState, mut rx: mpsc::Receiver<BuilderMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            BuilderMsg::Add { submit, reply } => {
                let result = add_request(&state, &submit).await;
                // Caller may have given up; nothing to do then
                let _ = reply.send(result);
            }
        }
    }
}

/// The serialized add path: find or create the building batch, rotate if a
/// limit would be exceeded, persist the request, rotate-by-tokens after.
async fn add_request(state: &ActorState, submit: &SubmitRequest) -> Result<Request> {
    let payload_canonical = serde_json::to_string(&submit.request_payload)?;
    let payload_size = payload_canonical.len() as i64;
    let estimated_tokens = state
        .estimator
        .estimate_input_tokens(&submit.model, &payload_canonical);

    if payload_size > MAX_BATCH_BYTES {
        return Err(Error::validation(format!(
            "request payload of {} bytes exceeds the batch size cap",
            payload_size
        )));
    }

    // First pass may hit a full batch; the second runs against the fresh
    // one created after rotation.
    for _ in 0..2 {
        let mut tx = state.pool.begin().await?;
        let batch = match batches::find_building_batch(&mut tx, &submit.url, &submit.model).await? {
            Some(batch) => batch,
            None => batches::insert_building(&mut tx, &submit.url, &submit.model).await?,
        };

        let over_count = batch.request_count + 1 > MAX_REQUESTS_PER_BATCH;
        let over_size = batch.size_bytes + payload_size > MAX_BATCH_BYTES;
        if over_count || over_size {
            tx.commit().await?;
            log::info!(
                "Rotating batch {} ({}, {}): count {} size {} bytes",
                batch.id,
                submit.url,
                submit.model,
                batch.request_count,
                batch.size_bytes
            );
            workflow::start_upload(&state.pool, &state.jobs, &state.events, &batch.id).await?;
            continue;
        }

        let request = requests::insert(
            &mut tx,
            &batch.id,
            submit,
            &payload_canonical,
            payload_size,
            estimated_tokens,
            estimated_tokens,
        )
        .await?;
        tx.commit().await?;

        rotate_by_tokens_if_needed(state, &batch).await?;
        return Ok(request);
    }

    Err(Error::internal("batch rotation did not converge"))
}

/// Rotate-by-tokens: once the building batch's estimated total reaches the
/// model queue limit, keeping it open only delays submission.
async fn rotate_by_tokens_if_needed(state: &ActorState, batch: &Batch) -> Result<()> {
    let limit = match state.capacity.get_batch_limit_tokens(&batch.model).await {
        Ok(limit) => limit,
        Err(e) => {
            // Not fatal for submit; admission re-checks before the provider
            // sees the batch
            log::warn!("Token-limit lookup failed for {}: {}", batch.model, e);
            return Ok(());
        }
    };

    let current = batches::get(&state.pool, &batch.id).await?;
    if current.state == "building" && current.estimated_input_tokens_total >= limit {
        log::info!(
            "Rotating batch {} by tokens: {} >= {}",
            current.id,
            current.estimated_input_tokens_total,
            limit
        );
        workflow::start_upload(&state.pool, &state.jobs, &state.events, &current.id).await?;
    }
    Ok(())
}
