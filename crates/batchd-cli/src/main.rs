//! batchd CLI - durable LLM batch inference broker
//!
//! Runs the broker daemon and gives operators a window into batches,
//! requests and delivery attempts.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "batchd")]
#[command(author, version, about = "Durable LLM batch inference broker", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override database path (or set BATCHD_DB_PATH env var)
    #[arg(long, env = "BATCHD_DB_PATH", global = true)]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker daemon (workers, scheduler, recovery)
    Serve,

    /// Submit a single request into its building batch
    Submit(commands::submit::SubmitArgs),

    /// Inspect and manage batches
    Batch {
        #[command(subcommand)]
        action: commands::batch::BatchAction,
    },

    /// Inspect requests and their delivery attempts
    Request {
        #[command(subcommand)]
        action: commands::request::RequestAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var("BATCHD_DB_PATH", db_path);
    }

    let config = batchd_core::BrokerConfig::from_env()?;
    let ctx = commands::Context {
        config,
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Serve => commands::serve::run(ctx).await,
        Commands::Submit(args) => commands::submit::run(ctx, args).await,
        Commands::Batch { action } => commands::batch::run(ctx, action).await,
        Commands::Request { action } => commands::request::run(ctx, action).await,
    }
}
