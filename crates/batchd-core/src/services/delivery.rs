//! Per-request result delivery
//!
//! A delivery job POSTs the full result line to a webhook or publishes it
//! to AMQP, appends an audit row, and finishes the request. Failures stay
//! on the request (`delivery_failed`); they never become request errors or
//! batch errors. Retries are the job queue's, bounded at
//! `DELIVERY_MAX_ATTEMPTS`.

use std::time::Duration;

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::models::{DeliveryConfig, DeliveryOutcome, Request};
use crate::state::RequestState;
use crate::store::requests;

// ============================================================================
// Webhook sink
// ============================================================================

/// POSTs result lines to caller webhooks.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn deliver(&self, url: &str, payload: &str) -> (DeliveryOutcome, Option<String>) {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => (DeliveryOutcome::Success, None),
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let body = body.chars().take(512).collect::<String>();
                (
                    DeliveryOutcome::HttpStatusNot2xx,
                    Some(format!("HTTP {}: {}", status, body)),
                )
            }
            Err(e) if e.is_timeout() => (DeliveryOutcome::Timeout, Some(e.to_string())),
            Err(e) if e.is_connect() => (DeliveryOutcome::ConnectionError, Some(e.to_string())),
            Err(e) => (DeliveryOutcome::Other, Some(e.to_string())),
        }
    }
}

// ============================================================================
// AMQP sink
// ============================================================================

/// Publishes result lines to RabbitMQ, queue or exchange form, with
/// publisher confirms. The connection is cached and rebuilt after errors.
pub struct AmqpSink {
    url: Option<String>,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl AmqpSink {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        Self { url, timeout, connection: Mutex::new(None) }
    }

    pub async fn deliver(
        &self,
        config: &DeliveryConfig,
        payload: &str,
    ) -> (DeliveryOutcome, Option<String>) {
        let Some(url) = &self.url else {
            return (
                DeliveryOutcome::RabbitmqNotConfigured,
                Some("AMQP_URL is not configured".to_string()),
            );
        };

        match self.deliver_inner(url, config, payload).await {
            Ok(()) => (DeliveryOutcome::Success, None),
            Err((outcome, msg)) => {
                if matches!(outcome, DeliveryOutcome::ConnectionError | DeliveryOutcome::Timeout) {
                    // Drop the cached connection; the next attempt redials
                    *self.connection.lock().await = None;
                }
                (outcome, Some(msg))
            }
        }
    }

    async fn deliver_inner(
        &self,
        url: &str,
        config: &DeliveryConfig,
        payload: &str,
    ) -> std::result::Result<(), (DeliveryOutcome, String)> {
        let channel = self.open_channel(url).await?;

        // Passive declares turn a missing target into a distinguished
        // outcome instead of a silently dropped publish. The broker closes
        // the channel on NOT_FOUND, so a fresh channel is opened per job.
        let (exchange, routing_key) = match config {
            DeliveryConfig::AmqpQueue { queue } => {
                let options = QueueDeclareOptions { passive: true, ..Default::default() };
                if let Err(e) = channel.queue_declare(queue, options, FieldTable::default()).await {
                    return Err(classify(&e, DeliveryOutcome::QueueNotFound));
                }
                ("", queue.as_str())
            }
            DeliveryConfig::AmqpExchange { exchange, routing_key } => {
                let options = ExchangeDeclareOptions { passive: true, ..Default::default() };
                if let Err(e) = channel
                    .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
                    .await
                {
                    return Err(classify(&e, DeliveryOutcome::ExchangeNotFound));
                }
                (exchange.as_str(), routing_key.as_str())
            }
            DeliveryConfig::Webhook { .. } => {
                return Err((
                    DeliveryOutcome::Other,
                    "webhook config routed to AMQP sink".to_string(),
                ));
            }
        };

        let publish = channel.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload.as_bytes(),
            BasicProperties::default().with_content_type("application/json".into()),
        );
        let confirm = match tokio::time::timeout(self.timeout, publish).await {
            Err(_) => return Err((DeliveryOutcome::Timeout, "publish timed out".to_string())),
            Ok(Err(e)) => return Err(classify(&e, DeliveryOutcome::Other)),
            Ok(Ok(confirm)) => confirm,
        };
        match tokio::time::timeout(self.timeout, confirm).await {
            Err(_) => Err((DeliveryOutcome::Timeout, "publish confirm timed out".to_string())),
            Ok(Err(e)) => Err(classify(&e, DeliveryOutcome::Other)),
            Ok(Ok(confirmation)) => {
                if confirmation.is_ack() {
                    Ok(())
                } else {
                    Err((DeliveryOutcome::Other, "broker nacked the publish".to_string()))
                }
            }
        }
    }

    async fn open_channel(
        &self,
        url: &str,
    ) -> std::result::Result<lapin::Channel, (DeliveryOutcome, String)> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().map(|c| !c.status().connected()).unwrap_or(true) {
            let connect = Connection::connect(url, ConnectionProperties::default());
            let connection = match tokio::time::timeout(self.timeout, connect).await {
                Err(_) => {
                    return Err((
                        DeliveryOutcome::Timeout,
                        "AMQP connect timed out".to_string(),
                    ))
                }
                Ok(Err(e)) => return Err((DeliveryOutcome::ConnectionError, e.to_string())),
                Ok(Ok(connection)) => connection,
            };
            *guard = Some(connection);
        }

        let connection = guard.as_ref().unwrap();
        match connection.create_channel().await {
            Ok(channel) => {
                if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                    return Err((DeliveryOutcome::ConnectionError, e.to_string()));
                }
                Ok(channel)
            }
            Err(e) => Err((DeliveryOutcome::ConnectionError, e.to_string())),
        }
    }
}

/// Map a lapin error: NOT_FOUND becomes the caller's missing-target
/// outcome, IO problems become connection errors. The broker's 404 reply
/// code surfaces in the protocol error text.
fn classify(e: &lapin::Error, not_found: DeliveryOutcome) -> (DeliveryOutcome, String) {
    let text = e.to_string();
    if text.contains("NOT_FOUND") || text.contains("NOT-FOUND") || text.contains("404") {
        return (not_found, text);
    }
    if matches!(e, lapin::Error::IOError(_)) {
        return (DeliveryOutcome::ConnectionError, text);
    }
    (DeliveryOutcome::Other, text)
}

// ============================================================================
// Delivery worker
// ============================================================================

/// Both sinks, built once from config and shared by delivery jobs.
pub struct DeliverySinks {
    pub webhook: WebhookSink,
    pub amqp: AmqpSink,
}

impl DeliverySinks {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        Ok(Self {
            webhook: WebhookSink::new(config.webhook_timeout)?,
            amqp: AmqpSink::new(config.amqp_url.clone(), config.amqp_timeout),
        })
    }
}

/// One delivery attempt for a request already in `openai_processed`:
/// transition to `delivering`, dispatch on the sink, append the audit row,
/// finish the request. A sink failure leaves the request `delivery_failed`
/// and returns `Error::Delivery` so the queue retries within its bound.
pub async fn deliver_once(
    pool: &SqlitePool,
    sinks: &DeliverySinks,
    request: &Request,
) -> Result<DeliveryOutcome> {
    let state = request.state()?;
    if state != RequestState::OpenaiProcessed {
        return Err(Error::validation(format!(
            "request {} is {}, not openai_processed",
            request.id, state
        )));
    }
    let payload = request.response_payload.as_deref().ok_or_else(|| {
        Error::validation(format!("request {} has no response payload", request.id))
    })?;
    let config = request.delivery_config()?;
    config.validate()?;

    requests::transition_pool(pool, &request.id, state, RequestState::Delivering).await?;

    let (outcome, error_msg) = match &config {
        DeliveryConfig::Webhook { url } => sinks.webhook.deliver(url, payload).await,
        DeliveryConfig::AmqpQueue { .. } | DeliveryConfig::AmqpExchange { .. } => {
            sinks.amqp.deliver(&config, payload).await
        }
    };

    // Audit row + counter + final state in one transaction
    let mut tx = pool.begin().await?;
    requests::increment_delivery_attempts(&mut tx, &request.id).await?;
    requests::insert_delivery_attempt(
        &mut tx,
        &request.id,
        outcome,
        &request.delivery_config,
        error_msg.as_deref(),
    )
    .await?;
    let to = if outcome == DeliveryOutcome::Success {
        RequestState::Delivered
    } else {
        // Delivery failures are an audit concern; Request.error_msg stays
        // untouched
        RequestState::DeliveryFailed
    };
    requests::transition(&mut tx, &request.id, RequestState::Delivering, to).await?;
    tx.commit().await?;

    if outcome == DeliveryOutcome::Success {
        log::debug!("Delivered request {} ({})", request.id, request.custom_id);
        Ok(outcome)
    } else {
        Err(Error::Delivery(format!(
            "request {}: {}{}",
            request.id,
            outcome,
            error_msg.map(|m| format!(" ({})", m)).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_amqp_not_configured() {
        let sink = AmqpSink::new(None, Duration::from_secs(1));
        let config = DeliveryConfig::AmqpQueue { queue: "results".to_string() };
        let (outcome, msg) = sink.deliver(&config, "{}").await;
        assert_eq!(outcome, DeliveryOutcome::RabbitmqNotConfigured);
        assert!(msg.unwrap().contains("AMQP_URL"));
    }

    #[tokio::test]
    async fn test_webhook_connection_refused() {
        let sink = WebhookSink::new(Duration::from_secs(2)).unwrap();
        // Nothing listens on this port
        let (outcome, msg) = sink.deliver("http://127.0.0.1:1/hook", "{}").await;
        assert!(
            matches!(outcome, DeliveryOutcome::ConnectionError | DeliveryOutcome::Other),
            "got {:?} ({:?})",
            outcome,
            msg
        );
    }
}
