//! Command implementations

pub mod batch;
pub mod request;
pub mod serve;
pub mod submit;

use crate::output::OutputFormat;
use batchd_core::BrokerConfig;

/// Shared command context
pub struct Context {
    pub config: BrokerConfig,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    /// Print a progress message unless --quiet
    pub fn progress(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }
}
