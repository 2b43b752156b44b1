//! Submit a single request into its `(url, model)` building batch.
//!
//! Submission only needs the store and the builder actor; no provider
//! credentials are required until a batch is actually uploaded.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Args;

use super::Context;
use batchd_core::services::{BatchBuilder, ConfigCapacityProvider, HeuristicTokenEstimator};
use batchd_core::{Database, DeliveryConfig, SubmitRequest};

#[derive(Args)]
pub struct SubmitArgs {
    /// Caller-side request id, unique within the batch
    #[arg(long)]
    pub custom_id: String,

    /// Target model
    #[arg(long)]
    pub model: String,

    /// Provider endpoint path
    #[arg(long, default_value = "/v1/chat/completions")]
    pub url: String,

    /// Request payload JSON (the full JSONL line), or @path to read a file
    #[arg(long)]
    pub payload: String,

    /// Deliver the result to this webhook URL
    #[arg(long, group = "delivery")]
    pub webhook: Option<String>,

    /// Deliver the result to this AMQP queue
    #[arg(long, group = "delivery")]
    pub amqp_queue: Option<String>,

    /// Deliver the result to this AMQP exchange (requires --routing-key)
    #[arg(long, group = "delivery")]
    pub amqp_exchange: Option<String>,

    /// Routing key for --amqp-exchange
    #[arg(long, requires = "amqp_exchange")]
    pub routing_key: Option<String>,
}

impl SubmitArgs {
    fn delivery_config(&self) -> Result<DeliveryConfig> {
        match (&self.webhook, &self.amqp_queue, &self.amqp_exchange) {
            (Some(url), None, None) => Ok(DeliveryConfig::Webhook { url: url.clone() }),
            (None, Some(queue), None) => Ok(DeliveryConfig::AmqpQueue { queue: queue.clone() }),
            (None, None, Some(exchange)) => Ok(DeliveryConfig::AmqpExchange {
                exchange: exchange.clone(),
                routing_key: self
                    .routing_key
                    .clone()
                    .context("--amqp-exchange requires --routing-key")?,
            }),
            _ => bail!("exactly one of --webhook, --amqp-queue, --amqp-exchange is required"),
        }
    }
}

pub async fn run(ctx: Context, args: SubmitArgs) -> Result<()> {
    let raw_payload = match args.payload.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading payload file {}", path))?,
        None => args.payload.clone(),
    };
    let request_payload: serde_json::Value =
        serde_json::from_str(&raw_payload).context("payload is not valid JSON")?;

    let submit = SubmitRequest {
        url: args.url.clone(),
        model: args.model.clone(),
        custom_id: args.custom_id.clone(),
        request_payload,
        delivery_config: args.delivery_config()?,
    };

    let db = Database::open(ctx.config.db_path.clone()).await?;
    let jobs = batchd_core::jobs::JobQueue::new(db.pool.clone());
    let events = batchd_core::events::EventBus::default();
    let capacity = Arc::new(ConfigCapacityProvider::new(ctx.config.clone()));
    let builder = Arc::new(BatchBuilder::new(
        db.pool.clone(),
        jobs,
        events,
        Arc::new(HeuristicTokenEstimator),
        capacity,
    ));

    let request = builder.submit_request(submit).await?;
    ctx.progress(&format!(
        "Submitted request {} into batch {}",
        request.custom_id, request.batch_id
    ));
    crate::output::print_detail(ctx.format, &request);
    Ok(())
}
