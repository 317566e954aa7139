use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use corkboard::board::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "corkboard")]
#[command(version, about = "Kanban task board service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the board server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "4920")]
        port: u16,

        /// Database path
        #[arg(long, default_value = ".corkboard/board.db")]
        db_path: PathBuf,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Initialize the database and exit
    InitDb {
        /// Database path
        #[arg(long, default_value = ".corkboard/board.db")]
        db_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("corkboard=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            start_server(ServerConfig {
                port,
                db_path,
                dev_mode: dev,
            })
            .await?;
        }
        Commands::InitDb { db_path } => {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
            corkboard::board::db::BoardDb::new(&db_path)
                .context("Failed to initialize board database")?;
            println!("Board database initialized at {}", db_path.display());
        }
    }

    Ok(())
}
