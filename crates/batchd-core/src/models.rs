//! Data models
//!
//! Row structs map 1:1 to the tables created in `db`; `state` columns stay
//! TEXT in the rows and are parsed through the `state` module enums on
//! demand. Aggregate columns on `Batch` are trigger-maintained and must
//! never be written by application code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::state::{BatchState, RequestState};

// ============================================================================
// Batch
// ============================================================================

/// A batch row: one provider batch job aggregating many requests.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Batch {
    pub id: String,
    pub model: String,
    /// Provider endpoint path, e.g. `/v1/chat/completions`.
    pub url: String,
    pub state: String,

    pub provider_input_file_id: Option<String>,
    pub provider_output_file_id: Option<String>,
    pub provider_error_file_id: Option<String>,
    pub provider_batch_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub provider_status_last_checked_at: Option<DateTime<Utc>>,
    pub waiting_for_capacity_since_at: Option<DateTime<Utc>>,

    // Trigger-maintained aggregates
    pub request_count: i64,
    pub size_bytes: i64,
    pub estimated_input_tokens_total: i64,

    pub provider_requests_completed: i64,
    pub provider_requests_failed: i64,
    pub provider_requests_total: i64,

    pub input_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub output_tokens: i64,

    pub capacity_wait_reason: Option<String>,
    pub token_limit_retry_attempts: i64,
    pub token_limit_retry_next_at: Option<DateTime<Utc>>,
    pub token_limit_retry_last_error: Option<String>,

    pub error_msg: Option<String>,
}

impl Batch {
    pub fn state(&self) -> Result<BatchState> {
        BatchState::from_str(&self.state).map_err(Error::internal)
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request row: one caller-submitted inference request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Request {
    pub id: String,
    pub batch_id: String,
    pub custom_id: String,
    pub url: String,
    pub model: String,
    pub state: String,

    /// Canonical JSONL line submitted to the provider.
    pub request_payload: String,
    pub request_payload_size: i64,
    /// Full provider result line, set on success.
    pub response_payload: Option<String>,

    pub estimated_input_tokens: i64,
    pub estimated_request_input_tokens: i64,

    /// JSON-encoded `DeliveryConfig`.
    pub delivery_config: String,

    pub error_msg: Option<String>,
    pub delivery_attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn state(&self) -> Result<RequestState> {
        RequestState::from_str(&self.state).map_err(Error::internal)
    }

    pub fn delivery_config(&self) -> Result<DeliveryConfig> {
        let config: DeliveryConfig = serde_json::from_str(&self.delivery_config)?;
        Ok(config)
    }
}

// ============================================================================
// Audit rows
// ============================================================================

/// Append-only audit of every batch state change.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BatchTransition {
    pub id: String,
    pub batch_id: String,
    pub from_state: String,
    pub to_state: String,
    pub transitioned_at: DateTime<Utc>,
}

/// Append-only audit of every delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequestDeliveryAttempt {
    pub id: String,
    pub request_id: String,
    pub outcome: String,
    pub delivery_config_snapshot: String,
    pub error_msg: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    HttpStatusNot2xx,
    ConnectionError,
    Timeout,
    QueueNotFound,
    ExchangeNotFound,
    RabbitmqNotConfigured,
    Other,
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::HttpStatusNot2xx => "http_status_not_2xx",
            DeliveryOutcome::ConnectionError => "connection_error",
            DeliveryOutcome::Timeout => "timeout",
            DeliveryOutcome::QueueNotFound => "queue_not_found",
            DeliveryOutcome::ExchangeNotFound => "exchange_not_found",
            DeliveryOutcome::RabbitmqNotConfigured => "rabbitmq_not_configured",
            DeliveryOutcome::Other => "other",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Delivery config
// ============================================================================

/// Where a request's result goes once the provider returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryConfig {
    Webhook {
        url: String,
    },
    AmqpQueue {
        queue: String,
    },
    AmqpExchange {
        exchange: String,
        routing_key: String,
    },
}

impl DeliveryConfig {
    /// Validate field presence and shape per variant.
    pub fn validate(&self) -> Result<()> {
        match self {
            DeliveryConfig::Webhook { url } => {
                if url.is_empty() {
                    return Err(Error::validation("webhook url must not be empty"));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(Error::validation(format!(
                        "webhook url must be http(s), got {:?}",
                        url
                    )));
                }
            }
            DeliveryConfig::AmqpQueue { queue } => {
                if queue.is_empty() {
                    return Err(Error::validation("amqp queue must not be empty"));
                }
            }
            DeliveryConfig::AmqpExchange { exchange, routing_key } => {
                if exchange.is_empty() {
                    return Err(Error::validation("amqp exchange must not be empty"));
                }
                if routing_key.is_empty() {
                    return Err(Error::validation("amqp routing_key must not be empty"));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Submit API
// ============================================================================

/// One inference request as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Provider endpoint path, e.g. `/v1/chat/completions`.
    pub url: String,
    pub model: String,
    /// Caller-supplied id, unique within the batch; correlates results.
    pub custom_id: String,
    /// Full JSONL line body: `{"custom_id", "method", "url", "body"}`.
    pub request_payload: serde_json::Value,
    pub delivery_config: DeliveryConfig,
}

impl SubmitRequest {
    /// Submit-time validation: delivery config shape plus internal payload
    /// consistency (`custom_id`, `model`, `url` must match the enclosing
    /// fields). Rejected before any row is written.
    pub fn validate(&self) -> Result<()> {
        if self.custom_id.is_empty() {
            return Err(Error::validation("custom_id must not be empty"));
        }
        if self.model.is_empty() {
            return Err(Error::validation("model must not be empty"));
        }
        if !self.url.starts_with('/') {
            return Err(Error::validation(format!(
                "url must be a provider endpoint path, got {:?}",
                self.url
            )));
        }
        self.delivery_config.validate()?;

        let payload = self
            .request_payload
            .as_object()
            .ok_or_else(|| Error::validation("request_payload must be a JSON object"))?;

        let payload_custom_id = payload.get("custom_id").and_then(|v| v.as_str());
        if payload_custom_id != Some(self.custom_id.as_str()) {
            return Err(Error::validation(format!(
                "request_payload.custom_id {:?} does not match custom_id {:?}",
                payload_custom_id, self.custom_id
            )));
        }

        let payload_url = payload.get("url").and_then(|v| v.as_str());
        if payload_url != Some(self.url.as_str()) {
            return Err(Error::validation(format!(
                "request_payload.url {:?} does not match url {:?}",
                payload_url, self.url
            )));
        }

        let payload_model = payload
            .get("body")
            .and_then(|b| b.get("model"))
            .and_then(|v| v.as_str());
        if payload_model != Some(self.model.as_str()) {
            return Err(Error::validation(format!(
                "request_payload.body.model {:?} does not match model {:?}",
                payload_model, self.model
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Provider result lines
// ============================================================================

/// One line of a provider output or error file.
///
/// Schema is bit-exact with the provider: `error` may be null, a string, or
/// an object; unknown response fields are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultLine {
    #[serde(default)]
    pub id: Option<String>,
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<ResultResponse>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status_code: i64,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResultLine {
    /// Error classification: a line is an error when it comes from the
    /// error file, carries a non-null `error`, has a non-200 status, or the
    /// response body itself embeds an `error` object.
    pub fn is_error(&self, from_error_file: bool) -> bool {
        if from_error_file {
            return true;
        }
        if let Some(error) = &self.error {
            if !error.is_null() {
                return true;
            }
        }
        match &self.response {
            None => true,
            Some(response) => {
                if response.status_code != 200 {
                    return true;
                }
                matches!(response.body.get("error"), Some(v) if !v.is_null())
            }
        }
    }
}
