//! Batch inspection and management.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{colored_state, print_detail, print_rows};
use batchd_core::store::batches;
use batchd_core::{Batch, Broker, Database};

#[derive(Subcommand)]
pub enum BatchAction {
    /// List recent batches
    List {
        /// How many batches to show
        #[arg(long, default_value_t = 25)]
        limit: i64,
    },
    /// Show one batch with its audit trail
    Show { id: String },
    /// Per-state batch counts
    Stats,
    /// Cancel a batch and all of its non-terminal requests
    Cancel { id: String },
    /// Re-run delivery for a finished batch's undelivered requests
    Redeliver {
        id: String,
        /// Also redeliver requests that were already delivered
        #[arg(long)]
        include_delivered: bool,
    },
}

#[derive(Tabled, Serialize)]
struct BatchRow {
    id: String,
    model: String,
    state: String,
    requests: i64,
    size_bytes: i64,
    est_tokens: i64,
    created_at: String,
}

impl BatchRow {
    fn from(batch: &Batch) -> Self {
        Self {
            id: batch.id.clone(),
            model: batch.model.clone(),
            state: colored_state(&batch.state),
            requests: batch.request_count,
            size_bytes: batch.size_bytes,
            est_tokens: batch.estimated_input_tokens_total,
            created_at: batch.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled, Serialize)]
struct TransitionRow {
    from: String,
    to: String,
    at: String,
}

#[derive(Tabled, Serialize)]
struct StateCountRow {
    state: String,
    count: i64,
}

pub async fn run(ctx: Context, action: BatchAction) -> Result<()> {
    match action {
        BatchAction::List { limit } => {
            let db = Database::open(ctx.config.db_path.clone()).await?;
            let rows: Vec<BatchRow> = batches::list_recent(&db.pool, limit)
                .await?
                .iter()
                .map(BatchRow::from)
                .collect();
            print_rows(ctx.format, &rows);
        }
        BatchAction::Show { id } => {
            let db = Database::open(ctx.config.db_path.clone()).await?;
            let batch = batches::get(&db.pool, &id).await?;
            print_detail(ctx.format, &batch);

            let transitions: Vec<TransitionRow> = batches::transitions(&db.pool, &id)
                .await?
                .iter()
                .map(|t| TransitionRow {
                    from: t.from_state.clone(),
                    to: colored_state(&t.to_state),
                    at: t.transitioned_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            if !transitions.is_empty() {
                println!();
                print_rows(ctx.format, &transitions);
            }
        }
        BatchAction::Stats => {
            let db = Database::open(ctx.config.db_path.clone()).await?;
            let counts = batches::batch_state_counts(&db.pool).await?;
            let rows: Vec<StateCountRow> = counts
                .counts
                .iter()
                .map(|(state, count)| StateCountRow {
                    state: colored_state(state),
                    count: *count,
                })
                .collect();
            print_rows(ctx.format, &rows);
        }
        BatchAction::Cancel { id } => {
            let broker = Broker::new(ctx.config.clone()).await?;
            broker.workflow.cancel_batch(&id).await?;
            ctx.progress(&format!("Batch {} cancelled", id));
        }
        BatchAction::Redeliver { id, include_delivered } => {
            let broker = Broker::new(ctx.config.clone()).await?;
            broker.workflow.redeliver(&id, include_delivered).await?;
            ctx.progress(&format!(
                "Batch {} queued for redelivery; run `batchd serve` to work the queue",
                id
            ));
        }
    }
    Ok(())
}
