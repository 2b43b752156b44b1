//! Request inspection.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{colored_state, print_detail, print_rows};
use batchd_core::store::requests;
use batchd_core::Database;

#[derive(Subcommand)]
pub enum RequestAction {
    /// Show one request with its delivery attempts
    Show { id: String },
    /// List the requests of a batch
    List {
        batch_id: String,
        /// Only requests in this state
        #[arg(long)]
        state: Option<String>,
    },
}

#[derive(Tabled, Serialize)]
struct RequestRow {
    id: String,
    custom_id: String,
    state: String,
    attempts: i64,
    payload_bytes: i64,
}

#[derive(Tabled, Serialize)]
struct AttemptRow {
    outcome: String,
    error: String,
    attempted_at: String,
}

pub async fn run(ctx: Context, action: RequestAction) -> Result<()> {
    let db = Database::open(ctx.config.db_path.clone()).await?;
    match action {
        RequestAction::Show { id } => {
            let request = requests::get(&db.pool, &id).await?;
            print_detail(ctx.format, &request);

            let attempts: Vec<AttemptRow> = requests::delivery_attempts(&db.pool, &id)
                .await?
                .iter()
                .map(|a| AttemptRow {
                    outcome: a.outcome.clone(),
                    error: a.error_msg.clone().unwrap_or_else(|| "-".to_string()),
                    attempted_at: a.attempted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            if !attempts.is_empty() {
                println!();
                print_rows(ctx.format, &attempts);
            }
        }
        RequestAction::List { batch_id, state } => {
            let all = match state {
                Some(state) => {
                    let state = state.parse().map_err(anyhow::Error::msg)?;
                    requests::list_by_state(&db.pool, &batch_id, state).await?
                }
                None => requests::list_for_batch(&db.pool, &batch_id).await?,
            };
            let rows: Vec<RequestRow> = all
                .iter()
                .map(|r| RequestRow {
                    id: r.id.clone(),
                    custom_id: r.custom_id.clone(),
                    state: colored_state(&r.state),
                    attempts: r.delivery_attempt_count,
                    payload_bytes: r.request_payload_size,
                })
                .collect();
            print_rows(ctx.format, &rows);
        }
    }
    Ok(())
}
