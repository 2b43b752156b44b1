#![allow(dead_code)]
//! Shared test fixtures: a scriptable provider, a tiny webhook receiver,
//! and a deterministic job drain that replaces the background workers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use batchd_core::error::{Error, Result};
use batchd_core::jobs::JobHandler;
use batchd_core::provider::{CreatedBatch, ProviderBatch, ProviderClient};
use batchd_core::{Broker, BrokerConfig, DeliveryConfig, SubmitRequest};

// ============================================================================
// Mock provider
// ============================================================================

/// Scripted provider: uploads are counted, polls pop a scripted snapshot
/// (the last one repeats), downloads serve canned file contents.
#[derive(Default)]
pub struct MockProvider {
    pub uploads: Mutex<Vec<Vec<u8>>>,
    pub files: Mutex<HashMap<String, String>>,
    pub polls: Mutex<VecDeque<ProviderBatch>>,
    pub created: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub deleted_files: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script_poll(&self, snapshot: ProviderBatch) {
        self.polls.lock().await.push_back(snapshot);
    }

    pub async fn put_file(&self, file_id: &str, content: String) {
        self.files.lock().await.insert(file_id.to_string(), content);
    }
}

/// A poll snapshot with everything defaulted.
pub fn snapshot(status: &str) -> ProviderBatch {
    ProviderBatch {
        provider_batch_id: "pb-scripted".to_string(),
        status: status.to_string(),
        request_counts: None,
        usage: None,
        output_file_id: None,
        error_file_id: None,
        errors: Vec::new(),
        expires_at: None,
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn upload_file(&self, jsonl: Vec<u8>) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().await.push(jsonl);
        Ok(format!("file-in-{}", n))
    }

    async fn create_batch(&self, _file_id: &str, _url: &str, _model: &str) -> Result<CreatedBatch> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("pb-{}", n);
        self.created.lock().await.push(id.clone());
        Ok(CreatedBatch {
            provider_batch_id: id,
            expires_at: Some(Utc::now() + chrono::Duration::hours(24)),
        })
    }

    async fn get_batch(&self, _provider_batch_id: &str) -> Result<ProviderBatch> {
        let mut polls = self.polls.lock().await;
        if polls.len() > 1 {
            Ok(polls.pop_front().unwrap())
        } else {
            polls
                .front()
                .cloned()
                .ok_or_else(|| Error::provider("mock poll script is empty"))
        }
    }

    async fn download_file(&self, file_id: &str) -> Result<PathBuf> {
        let files = self.files.lock().await;
        let content = files
            .get(file_id)
            .ok_or_else(|| Error::not_found(format!("mock file {}", file_id)))?;
        let path = std::env::temp_dir().join(format!("batchd-test-{}-{}.jsonl", file_id, uuid()));
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    async fn cancel_batch(&self, provider_batch_id: &str) -> Result<()> {
        self.cancelled.lock().await.push(provider_batch_id.to_string());
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.deleted_files.lock().await.push(file_id.to_string());
        Ok(())
    }
}

fn uuid() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    format!(
        "{}",
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    )
}

// ============================================================================
// Broker fixture
// ============================================================================

pub struct TestBroker {
    pub broker: Broker,
    pub provider: Arc<MockProvider>,
    _dir: tempfile::TempDir,
}

/// A broker over a temp database and the mock provider. Workers are NOT
/// started; tests drain the job queue synchronously.
pub async fn test_broker() -> TestBroker {
    test_broker_custom(|_| {}).await
}

/// Same, with a hook to tweak the config (queue limits, AMQP url).
pub async fn test_broker_custom(tweak: impl FnOnce(&mut BrokerConfig)) -> TestBroker {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let mut config = BrokerConfig {
        db_path: dir.path().join("test.db"),
        ..BrokerConfig::default()
    };
    tweak(&mut config);
    let provider = MockProvider::new();
    let broker = Broker::with_provider(config, provider.clone())
        .await
        .expect("broker");
    TestBroker { broker, provider, _dir: dir }
}

/// Run every queued job to completion, synchronously, including retries
/// and exhaustion hooks. Scheduled jobs are forced due first.
pub async fn drain_jobs(t: &TestBroker) {
    for _ in 0..60 {
        sqlx::query("UPDATE jobs SET run_at = ? WHERE state = 'pending'")
            .bind(Utc::now())
            .execute(&t.broker.db.pool)
            .await
            .expect("force due");

        let mut ran = 0;
        for queue in ["batch_uploads", "batch_processing", "default", "delivery"] {
            let jobs = t.broker.jobs.claim_due(queue, 32).await.expect("claim");
            for job in jobs {
                ran += 1;
                match t.broker.workflow.handle(&job).await {
                    Ok(()) => t.broker.jobs.complete(&job.id).await.expect("complete"),
                    Err(e) => {
                        let exhausted = t.broker.jobs.fail(&job, &e).await.expect("fail");
                        if exhausted {
                            t.broker.workflow.on_exhausted(&job, &e).await;
                        }
                    }
                }
            }
        }
        if ran == 0 {
            return;
        }
    }
    panic!("job queue did not drain");
}

// ============================================================================
// Submissions
// ============================================================================

pub fn submit(custom_id: &str, model: &str, delivery: DeliveryConfig) -> SubmitRequest {
    SubmitRequest {
        url: "/v1/chat/completions".to_string(),
        model: model.to_string(),
        custom_id: custom_id.to_string(),
        request_payload: json!({
            "custom_id": custom_id,
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": {
                "model": model,
                "messages": [{"role": "user", "content": format!("prompt for {}", custom_id)}],
            },
        }),
        delivery_config: delivery,
    }
}

pub fn webhook(url: &str) -> DeliveryConfig {
    DeliveryConfig::Webhook { url: url.to_string() }
}

/// A provider result line for `custom_id`, success form.
pub fn ok_line(custom_id: &str) -> String {
    json!({
        "id": format!("resp-{}", custom_id),
        "custom_id": custom_id,
        "response": {"status_code": 200, "body": {"choices": [{"message": {"role": "assistant", "content": "hi"}}]}},
        "error": null,
    })
    .to_string()
}

/// A provider result line for `custom_id`, error form.
pub fn err_line(custom_id: &str, code: &str) -> String {
    json!({
        "id": format!("resp-{}", custom_id),
        "custom_id": custom_id,
        "response": null,
        "error": code,
    })
    .to_string()
}

// ============================================================================
// Webhook receiver
// ============================================================================

/// Minimal HTTP receiver that answers 200 to every POST and counts hits.
pub async fn spawn_webhook_receiver() -> (String, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind webhook receiver");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handle = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let hits = Arc::clone(&hits_handle);
            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    data.extend_from_slice(&buf[..n]);
                    let Some(header_end) = find_subslice(&data, b"\r\n\r\n") else { continue };
                    let headers = String::from_utf8_lossy(&data[..header_end]);
                    let content_length = headers
                        .lines()
                        .find_map(|line| {
                            let line = line.to_ascii_lowercase();
                            line.strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if data.len() >= header_end + 4 + content_length {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let _ = socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                            )
                            .await;
                        let _ = socket.shutdown().await;
                        break;
                    }
                }
            });
        }
    });

    (format!("http://{}/hook", addr), hits)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
