mod api;
mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gridrank")]
#[command(about = "College football Elo rankings and predictions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Pull teams, games and polls from the provider and process new results
    Update {
        #[arg(short, long)]
        year: Option<i64>,
    },
    /// Reset preseason ratings and replay the season
    Recompute {
        #[arg(short, long)]
        year: Option<i64>,
    },
    /// Print the current ranking table
    Rankings {
        #[arg(short, long)]
        year: Option<i64>,
        #[arg(short, long, default_value = "25")]
        limit: usize,
    },
    /// Load the development fixture (no provider key required)
    Seed {
        #[arg(short, long)]
        year: Option<i64>,
    },
    /// Initialize the database schema
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gridrank=info,tower_http=info")),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting gridrank API server on port {}", port);
            api::serve(port).await?;
        }
        Some(Commands::Update { year }) => {
            cli::run_update(year).await?;
        }
        Some(Commands::Recompute { year }) => {
            cli::recompute(year).await?;
        }
        Some(Commands::Rankings { year, limit }) => {
            cli::show_rankings(year, limit).await?;
        }
        Some(Commands::Seed { year }) => {
            cli::seed(year).await?;
        }
        Some(Commands::InitDb) => {
            tracing::info!("Initializing database...");
            db::init_database().await?;
        }
        None => {
            tracing::info!("Starting gridrank API server on port 3000");
            api::serve(3000).await?;
        }
    }

    Ok(())
}
