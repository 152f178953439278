use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use campus_qa::config::{self, Secrets};
use campus_qa::gateway::Gateway;
use campus_qa::models::BoardKind;
use campus_qa::search::QueryEngine;
use campus_qa::{db, ingest, migrate, server};

#[derive(Parser)]
#[command(
    name = "cqa",
    about = "campus-qa — a multimodal board-crawling RAG question-answering service",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/cqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Crawl the boards and ingest new posts
    Crawl {
        /// Restrict to a single board (notice, job, seminar, faculty,
        /// guest-faculty, staff)
        #[arg(long)]
        board: Option<String>,
    },

    /// Answer one question from the command line
    Ask {
        /// The question
        question: String,
    },

    /// Start the HTTP server
    Serve,

    /// Show per-board crawl state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Crawl { board } => {
            let board = match board {
                Some(name) => Some(
                    BoardKind::parse(&name)
                        .ok_or_else(|| anyhow::anyhow!("unknown board: {}", name))?,
                ),
                None => None,
            };
            let secrets = Secrets::from_env()?;
            let gateway = Gateway::connect(cfg, secrets).await?;
            ingest::run_crawl(&gateway, board).await?;
        }
        Commands::Ask { question } => {
            let secrets = Secrets::from_env()?;
            let gateway = Arc::new(Gateway::connect(cfg, secrets).await?);
            let engine = QueryEngine::build(gateway).await?;
            let response = engine.answer(&question).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Serve => {
            let bind = cfg.server.bind.clone();
            let secrets = Secrets::from_env()?;
            let gateway = Arc::new(Gateway::connect(cfg, secrets).await?);
            let engine = Arc::new(QueryEngine::build(gateway).await?);
            server::run_server(engine, &bind).await?;
        }
        Commands::Status => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let store = campus_qa::store::DocumentStore::new(pool.clone());
            let states = store.all_crawl_states().await?;
            if states.is_empty() {
                println!("No crawl history yet.");
            } else {
                for state in states {
                    println!(
                        "{}: last id {}, updated {}, processed {}",
                        state.board_type,
                        state.last_processed_id,
                        state.last_updated,
                        state.processed_count
                    );
                }
            }
            pool.close().await;
        }
    }

    Ok(())
}
