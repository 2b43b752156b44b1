//! Provider Batch API client
//!
//! The broker talks to the provider through the `ProviderClient` trait:
//! upload a JSONL input file, create a batch over it, poll the batch,
//! download result files, clean up. `OpenAiClient` is the real
//! implementation; tests swap in mocks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::multipart;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};

// ============================================================================
// Wire types
// ============================================================================

/// Provider-side batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl ProviderStatus {
    /// Unknown strings come back as None; the poll loop logs and retries
    /// rather than guessing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validating" => Some(ProviderStatus::Validating),
            "in_progress" => Some(ProviderStatus::InProgress),
            "finalizing" => Some(ProviderStatus::Finalizing),
            "completed" => Some(ProviderStatus::Completed),
            "failed" => Some(ProviderStatus::Failed),
            "expired" => Some(ProviderStatus::Expired),
            "cancelled" | "cancelling" => Some(ProviderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Per-batch request counters as reported by the provider.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ProviderRequestCounts {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub completed: i64,
    #[serde(default)]
    pub failed: i64,
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
    #[serde(default)]
    pub reasoning_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// One entry of the provider's batch error list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderBatchError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Snapshot of a provider batch, as returned by `get_batch`.
#[derive(Debug, Clone)]
pub struct ProviderBatch {
    pub provider_batch_id: String,
    pub status: String,
    pub request_counts: Option<ProviderRequestCounts>,
    pub usage: Option<ProviderUsage>,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub errors: Vec<ProviderBatchError>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProviderBatch {
    /// Whether the batch failed on the provider's enqueued-token cap.
    pub fn is_token_limit_exceeded(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.code.as_deref() == Some("token_limit_exceeded"))
    }
}

/// Result of creating a provider batch.
#[derive(Debug, Clone)]
pub struct CreatedBatch {
    pub provider_batch_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Client trait
// ============================================================================

/// Everything the workflow needs from the upstream Batch API.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
    /// Upload a rendered JSONL input file; returns the provider file id.
    async fn upload_file(&self, jsonl: Vec<u8>) -> Result<String>;

    /// Create a batch over an uploaded file for an endpoint path.
    async fn create_batch(&self, file_id: &str, url: &str, model: &str) -> Result<CreatedBatch>;

    /// Poll a batch.
    async fn get_batch(&self, provider_batch_id: &str) -> Result<ProviderBatch>;

    /// Download a result file to a local temp path.
    async fn download_file(&self, file_id: &str) -> Result<PathBuf>;

    /// Cancel a batch. A batch the provider no longer knows is
    /// `Error::NotFound`.
    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()>;

    /// Delete a file. Missing files are `Error::NotFound`.
    async fn delete_file(&self, file_id: &str) -> Result<()>;
}

// ============================================================================
// OpenAI-style implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchCreateResponse {
    id: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BatchStatusResponse {
    id: String,
    status: String,
    #[serde(default)]
    request_counts: Option<ProviderRequestCounts>,
    #[serde(default)]
    usage: Option<ProviderUsage>,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    errors: Option<BatchErrorList>,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BatchErrorList {
    #[serde(default)]
    data: Vec<ProviderBatchError>,
}

/// HTTP client for the provider's file + batch endpoints.
pub struct OpenAiClient {
    client: reqwest::Client,
    download_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::config("OPENAI_API_KEY is not configured"))?;

        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout)
            .build()?;
        // Result files can be large; downloads get their own timeout.
        let download_client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()?;

        Ok(Self {
            client,
            download_client,
            base_url: config.base_url.clone(),
            api_key,
        })
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// Map a non-success response: 5xx is transient (retried by the job
    /// queue), 404 is NotFound, other 4xx is permanent.
    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.is_server_error() {
            // error_for_status gives a reqwest::Error, which the job queue
            // treats as transient
            return Err(response.error_for_status().unwrap_err().into());
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("{}: provider returned 404", what)));
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::provider(format!("{} failed ({}): {}", what, status, text)))
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    async fn upload_file(&self, jsonl: Vec<u8>) -> Result<String> {
        let file_part = multipart::Part::bytes(jsonl)
            .file_name("batch_requests.jsonl")
            .mime_str("application/jsonl")?;
        let form = multipart::Form::new()
            .part("file", file_part)
            .text("purpose", "batch");

        let response = self
            .auth(self.client.post(format!("{}/v1/files", self.base_url)))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check(response, "file upload").await?;

        let upload: FileUploadResponse = response.json().await?;
        Ok(upload.id)
    }

    async fn create_batch(&self, file_id: &str, url: &str, _model: &str) -> Result<CreatedBatch> {
        let body = serde_json::json!({
            "input_file_id": file_id,
            "endpoint": url,
            "completion_window": "24h",
        });

        let response = self
            .auth(self.client.post(format!("{}/v1/batches", self.base_url)))
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response, "batch create").await?;

        let created: BatchCreateResponse = response.json().await?;
        Ok(CreatedBatch {
            provider_batch_id: created.id,
            expires_at: created.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    async fn get_batch(&self, provider_batch_id: &str) -> Result<ProviderBatch> {
        let response = self
            .auth(
                self.client
                    .get(format!("{}/v1/batches/{}", self.base_url, provider_batch_id)),
            )
            .send()
            .await?;
        let response = Self::check(response, "batch status").await?;

        let status: BatchStatusResponse = response.json().await?;
        Ok(ProviderBatch {
            provider_batch_id: status.id,
            status: status.status,
            request_counts: status.request_counts,
            usage: status.usage,
            output_file_id: status.output_file_id,
            error_file_id: status.error_file_id,
            errors: status.errors.map(|e| e.data).unwrap_or_default(),
            expires_at: status.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<PathBuf> {
        let response = self
            .auth(
                self.download_client
                    .get(format!("{}/v1/files/{}/content", self.base_url, file_id)),
            )
            .send()
            .await?;
        let response = Self::check(response, "file download").await?;

        let path = std::env::temp_dir().join(format!("batchd-{}-{}.jsonl", file_id, Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(path)
    }

    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()> {
        let response = self
            .auth(self.client.post(format!(
                "{}/v1/batches/{}/cancel",
                self.base_url, provider_batch_id
            )))
            .send()
            .await?;
        Self::check(response, "batch cancel").await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let response = self
            .auth(
                self.client
                    .delete(format!("{}/v1/files/{}", self.base_url, file_id)),
            )
            .send()
            .await?;
        Self::check(response, "file delete").await?;
        Ok(())
    }
}

/// Remove a downloaded result file, logging rather than failing.
pub async fn cleanup_downloaded(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log::warn!("Could not remove downloaded file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_parse() {
        assert_eq!(ProviderStatus::parse("validating"), Some(ProviderStatus::Validating));
        assert_eq!(ProviderStatus::parse("in_progress"), Some(ProviderStatus::InProgress));
        assert_eq!(ProviderStatus::parse("completed"), Some(ProviderStatus::Completed));
        assert_eq!(ProviderStatus::parse("cancelling"), Some(ProviderStatus::Cancelled));
        assert_eq!(ProviderStatus::parse("melting"), None);
    }

    #[test]
    fn test_token_limit_detection() {
        let batch = ProviderBatch {
            provider_batch_id: "batch_1".to_string(),
            status: "failed".to_string(),
            request_counts: None,
            usage: None,
            output_file_id: None,
            error_file_id: None,
            errors: vec![ProviderBatchError {
                code: Some("token_limit_exceeded".to_string()),
                message: Some("Enqueued token limit reached".to_string()),
            }],
            expires_at: None,
        };
        assert!(batch.is_token_limit_exceeded());
    }

    #[test]
    fn test_status_response_parsing() {
        let json = r#"{
            "id": "batch_abc",
            "status": "completed",
            "request_counts": {"total": 3, "completed": 2, "failed": 1},
            "usage": {"input_tokens": 100, "output_tokens": 40},
            "output_file_id": "file-out",
            "error_file_id": null,
            "expires_at": 1767225600
        }"#;
        let parsed: BatchStatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, "completed");
        assert_eq!(parsed.request_counts.unwrap().completed, 2);
        assert_eq!(parsed.usage.unwrap().input_tokens, 100);
        assert_eq!(parsed.output_file_id.as_deref(), Some("file-out"));
        assert!(parsed.errors.is_none());
    }
}
