//! # batchd-core
//!
//! Core logic for batchd, a durable broker for LLM batch inference.
//! Callers submit single requests; the broker aggregates them into
//! provider batches, drives each batch through upload, provider
//! processing, download and reconciliation, and delivers every result to
//! a webhook or AMQP sink with at-least-once semantics.
//!
//! This crate provides:
//! - Database and typed persistence (`db`, `store` modules)
//! - The batch and request state machines (`state` module)
//! - The durable job queue (`jobs` module)
//! - The provider Batch API client (`provider` module)
//! - Builder, admission, dispatch, workflow, reconciliation, delivery,
//!   recovery and scheduling services (`services` module)
//! - Unified error handling (`error` module)

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod models;
pub mod provider;
pub mod services;
pub mod state;
pub mod store;

// Re-exports for convenience
pub use broker::Broker;
pub use config::BrokerConfig;
pub use db::Database;
pub use error::{Error, Result};

// Re-export commonly used types from models and state
pub use models::{
    Batch, BatchTransition, DeliveryConfig, DeliveryOutcome, Request, RequestDeliveryAttempt,
    ResultLine, SubmitRequest,
};
pub use state::{BatchState, RequestState};

// Re-export commonly used service types
pub use services::{
    AdmissionDecision, BatchBuilder, CapacityProvider, DeliverySinks, HeuristicTokenEstimator,
    SchedulerService, TokenEstimator, Workflow,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!version().is_empty());
    }
}
