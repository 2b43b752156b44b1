//! Typed persistence over the broker tables
//!
//! All state mutations go through the transition helpers here: they
//! compare-and-set the `state` column, write the audit row in the same
//! transaction, and reject anything the state machines do not allow.
//! Aggregates are never written here; the `db` triggers own them.

pub mod batches;
pub mod requests;

pub use batches::{BatchStateCounts, RequestStateCounts};
