//! Admission control
//!
//! Decides whether a batch that is ready for the provider fits under its
//! model's enqueued-token limit. Reservation is computed on the fly from
//! persisted aggregates; there is no in-memory reservation state.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::models::Batch;
use crate::store::batches;

// ============================================================================
// Capacity and token estimation
// ============================================================================

/// Per-model enqueued-token capacity.
#[async_trait]
pub trait CapacityProvider: Send + Sync + 'static {
    async fn get_batch_limit_tokens(&self, model: &str) -> Result<i64>;
}

/// Capacity limits straight from the broker config.
pub struct ConfigCapacityProvider {
    config: BrokerConfig,
}

impl ConfigCapacityProvider {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CapacityProvider for ConfigCapacityProvider {
    async fn get_batch_limit_tokens(&self, model: &str) -> Result<i64> {
        Ok(self.config.queue_limit_tokens(model))
    }
}

/// Per-model input token estimation for a request payload.
pub trait TokenEstimator: Send + Sync + 'static {
    fn estimate_input_tokens(&self, model: &str, payload: &str) -> i64;
}

/// Byte-length heuristic: ~4 bytes per token across current tokenizers.
/// Over-estimating is the safe direction for admission.
pub struct HeuristicTokenEstimator;

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate_input_tokens(&self, _model: &str, payload: &str) -> i64 {
        (payload.len() as i64 / 4).max(1)
    }
}

// ============================================================================
// Admission decision
// ============================================================================

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit {
        limit: i64,
        reserved: i64,
        needed: i64,
    },
    WaitCapacityBlocked {
        reason: String,
        limit: i64,
        reserved: i64,
        needed: i64,
    },
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit { .. })
    }
}

/// Reason recorded when headroom is the blocker.
pub const REASON_INSUFFICIENT_HEADROOM: &str = "insufficient_headroom";
/// Reason recorded when the capacity lookup itself failed.
pub const REASON_CAPACITY_CHECK_FAILED: &str = "capacity_check_failed";

/// Check whether `batch` fits under its model's limit given what is
/// already enqueued. A failed capacity lookup blocks; ambiguity never
/// admits.
pub async fn check(
    pool: &SqlitePool,
    capacity: &dyn CapacityProvider,
    batch: &Batch,
) -> Result<AdmissionDecision> {
    let limit = match capacity.get_batch_limit_tokens(&batch.model).await {
        Ok(limit) => limit,
        Err(e) => {
            log::warn!("Capacity lookup failed for model {}: {}", batch.model, e);
            return Ok(AdmissionDecision::WaitCapacityBlocked {
                reason: REASON_CAPACITY_CHECK_FAILED.to_string(),
                limit: 0,
                reserved: 0,
                needed: batch.estimated_input_tokens_total.max(0),
            });
        }
    };

    let reserved = batches::reserved_tokens(pool, &batch.model, &batch.id).await?;
    let headroom = (limit - reserved).max(0);
    let needed = batch.estimated_input_tokens_total.max(0);

    if needed <= headroom {
        Ok(AdmissionDecision::Admit { limit, reserved, needed })
    } else {
        Ok(AdmissionDecision::WaitCapacityBlocked {
            reason: REASON_INSUFFICIENT_HEADROOM.to_string(),
            limit,
            reserved,
            needed,
        })
    }
}

/// A capacity provider that always errors; used to exercise the
/// never-admit-on-ambiguity edge in tests.
pub struct FailingCapacityProvider;

#[async_trait]
impl CapacityProvider for FailingCapacityProvider {
    async fn get_batch_limit_tokens(&self, model: &str) -> Result<i64> {
        Err(Error::Capacity(format!("no limit known for {}", model)))
    }
}
