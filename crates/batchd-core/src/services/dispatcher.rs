//! Capacity dispatcher
//!
//! Scans `waiting_for_capacity` batches per model, oldest wait first, and
//! promotes every batch that fits under the model's enqueued-token limit.
//! The scan keeps going past a batch that does not fit, so a smaller
//! younger batch may be admitted while an older larger one keeps waiting;
//! that favors utilization over strict FIFO.

use chrono::Utc;

use crate::error::Result;
use crate::services::admission::REASON_INSUFFICIENT_HEADROOM;
use crate::services::workflow::Workflow;
use crate::state::BatchState;
use crate::store::batches;

/// Dispatch every model that has waiting batches. Returns how many batches
/// were promoted.
pub async fn dispatch_all(workflow: &Workflow) -> Result<usize> {
    let models = batches::models_with_waiting(workflow.pool()).await?;
    let mut promoted = 0;
    for model in models {
        promoted += dispatch_model(workflow, &model).await?;
    }
    Ok(promoted)
}

/// One dispatch pass for a model.
pub async fn dispatch_model(workflow: &Workflow, model: &str) -> Result<usize> {
    let limit = match workflow.capacity().get_batch_limit_tokens(model).await {
        Ok(limit) => limit,
        Err(e) => {
            // Never admit on ambiguity; the next tick retries
            log::warn!("Capacity lookup failed for model {}: {}", model, e);
            return Ok(0);
        }
    };

    let mut reserved = batches::reserved_tokens(workflow.pool(), model, "").await?;
    let waiting = batches::list_waiting_for_capacity(workflow.pool(), model).await?;
    if waiting.is_empty() {
        return Ok(0);
    }
    log::debug!(
        "Dispatching model {}: limit {}, reserved {}, {} waiting",
        model,
        limit,
        reserved,
        waiting.len()
    );

    let now = Utc::now();
    let mut promoted = 0;
    for batch in waiting {
        // Token-limit backoff still pending
        if let Some(next_at) = batch.token_limit_retry_next_at {
            if next_at > now {
                continue;
            }
        }

        let needed = batch.estimated_input_tokens_total.max(0);
        if needed > limit - reserved {
            batches::set_capacity_wait_reason(
                workflow.pool(),
                &batch.id,
                REASON_INSUFFICIENT_HEADROOM,
            )
            .await?;
            continue;
        }

        match workflow.submit_to_provider(&batch, BatchState::WaitingForCapacity).await {
            Ok(()) => {
                reserved += needed;
                promoted += 1;
            }
            Err(e) => {
                // Transient provider trouble; leave the batch waiting and
                // let the next tick retry it
                log::warn!("Could not promote waiting batch {}: {}", batch.id, e);
            }
        }
    }

    if promoted > 0 {
        log::info!("Promoted {} waiting batch(es) for model {}", promoted, model);
    }
    Ok(promoted)
}
