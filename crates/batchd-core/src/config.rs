//! Broker configuration and operating limits
//!
//! Everything is env-derived with sane defaults so the daemon and the CLI
//! can share one loading path. Model queue limits can be overridden per
//! model with `BATCHD_QUEUE_LIMIT_<MODEL>` (model name uppercased, `-` and
//! `.` replaced with `_`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Hard cap on the rendered JSONL size of one batch.
pub const MAX_BATCH_BYTES: i64 = 200 * 1024 * 1024;

/// Hard cap on the number of requests in one batch.
pub const MAX_REQUESTS_PER_BATCH: i64 = 50_000;

/// A `building` batch older than this is force-promoted (or destroyed if empty).
pub const BUILDING_BATCH_STALE_AGE: Duration = Duration::from_secs(60 * 60);

/// Backoff schedule (minutes) for provider token_limit_exceeded failures.
pub const TOKEN_LIMIT_RETRY_DELAYS_MIN: [i64; 5] = [5, 10, 20, 40, 80];

/// Delivery attempts per request before the job queue gives up.
pub const DELIVERY_MAX_ATTEMPTS: i32 = 3;

/// Per-model enqueued-token limits (provider batch queue capacity).
/// Unknown models fall back to `default_queue_limit_tokens`.
const BUILTIN_QUEUE_LIMITS: &[(&str, i64)] = &[
    ("gpt-4o", 90_000_000),
    ("gpt-4o-mini", 1_350_000_000),
    ("gpt-4.1", 90_000_000),
    ("gpt-4.1-mini", 400_000_000),
    ("o3", 90_000_000),
    ("o4-mini", 200_000_000),
];

/// Runtime configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Provider API key. Required to talk to the real provider.
    pub api_key: Option<String>,
    /// Provider base URL.
    pub base_url: String,
    /// AMQP broker URL. When absent, AMQP deliveries fail with
    /// `rabbitmq_not_configured`.
    pub amqp_url: Option<String>,
    /// Per-model enqueued-token limits.
    pub queue_limits: HashMap<String, i64>,
    /// Fallback limit for models without an explicit entry.
    pub default_queue_limit_tokens: i64,
    /// Timeout for provider metadata calls (create/poll/cancel).
    pub provider_timeout: Duration,
    /// Timeout for result file downloads.
    pub download_timeout: Duration,
    /// Timeout for webhook deliveries.
    pub webhook_timeout: Duration,
    /// Timeout for AMQP publish confirms.
    pub amqp_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("batchd.db"),
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            amqp_url: None,
            queue_limits: BUILTIN_QUEUE_LIMITS
                .iter()
                .map(|(m, l)| (m.to_string(), *l))
                .collect(),
            default_queue_limit_tokens: 90_000_000,
            provider_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(600),
            webhook_timeout: Duration::from_secs(30),
            amqp_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            db_path: get_db_path()?,
            ..Self::default()
        };

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(url) = std::env::var("AMQP_URL") {
            if !url.is_empty() {
                config.amqp_url = Some(url);
            }
        }
        if let Ok(limit) = std::env::var("BATCHD_DEFAULT_QUEUE_LIMIT") {
            config.default_queue_limit_tokens = limit
                .parse()
                .map_err(|_| Error::config("BATCHD_DEFAULT_QUEUE_LIMIT must be an integer"))?;
        }

        // Per-model overrides: BATCHD_QUEUE_LIMIT_GPT_4O=90000000
        for (key, value) in std::env::vars() {
            if let Some(model_key) = key.strip_prefix("BATCHD_QUEUE_LIMIT_") {
                if model_key.is_empty() {
                    continue;
                }
                let tokens: i64 = value.parse().map_err(|_| {
                    Error::config(format!("{} must be an integer, got {:?}", key, value))
                })?;
                config.queue_limits.insert(env_key_to_model(model_key), tokens);
            }
        }

        Ok(config)
    }

    /// Enqueued-token limit for a model.
    pub fn queue_limit_tokens(&self, model: &str) -> i64 {
        self.queue_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_queue_limit_tokens)
    }
}

/// Translate an env-var suffix back into a model name: `GPT_4O` -> `gpt-4o`.
/// Ambiguous for model names that mix `-` and `.`; those keep the builtin
/// table entry.
fn env_key_to_model(key: &str) -> String {
    key.to_lowercase().replace('_', "-")
}

/// Get database file path.
/// Priority: BATCHD_DB_PATH env var > default app data directory
pub fn get_db_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("BATCHD_DB_PATH") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let dirs = directories::ProjectDirs::from("io", "batchd", "Batchd")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("batchd.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_limit_lookup() {
        let config = BrokerConfig::default();
        assert_eq!(config.queue_limit_tokens("gpt-4o"), 90_000_000);
        assert_eq!(
            config.queue_limit_tokens("some-unknown-model"),
            config.default_queue_limit_tokens
        );
    }

    #[test]
    fn test_env_key_to_model() {
        assert_eq!(env_key_to_model("GPT_4O"), "gpt-4o");
        assert_eq!(env_key_to_model("O4_MINI"), "o4-mini");
    }

    #[test]
    fn test_limits_are_spec_values() {
        assert_eq!(MAX_BATCH_BYTES, 209_715_200);
        assert_eq!(MAX_REQUESTS_PER_BATCH, 50_000);
        assert_eq!(TOKEN_LIMIT_RETRY_DELAYS_MIN, [5, 10, 20, 40, 80]);
    }
}
