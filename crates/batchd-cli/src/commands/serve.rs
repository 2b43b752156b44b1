//! The broker daemon.

use anyhow::Result;

use super::Context;
use batchd_core::Broker;

pub async fn run(ctx: Context) -> Result<()> {
    ctx.progress(&format!(
        "Starting batchd (db: {})",
        ctx.config.db_path.display()
    ));

    let broker = Broker::new(ctx.config.clone()).await?;
    broker.start().await?;
    ctx.progress("Broker running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    ctx.progress("Shutting down");
    broker.shutdown().await;
    Ok(())
}
