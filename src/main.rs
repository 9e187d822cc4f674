use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;

use gita_rag::config::Config;
use gita_rag::rag::{embedder_from_config, open_vector_store, RagPipeline, SharedPipeline};
use gita_rag::server;

/// Question answering over a single PDF, grounded by retrieved passages
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Document to index, overrides PDF_PATH
    #[arg(long, global = true)]
    pdf: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the streaming chat endpoint (default)
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Build the vector index and exit
    Index {
        /// Rebuild even if an index already exists
        #[arg(long)]
        force: bool,
    },
    /// Ask questions interactively on the terminal
    Ask,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(pdf) = args.pdf {
        config.pdf_path = pdf;
    }
    info!("Source document: {}", config.pdf_path.display());

    match args.command.unwrap_or(Command::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
    }) {
        Command::Serve { host, port } => {
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
            server::serve(SharedPipeline::new(config), addr).await?;
        }
        Command::Index { force } => {
            let embedder = embedder_from_config(&config);
            let store = open_vector_store(&config, embedder.as_ref(), force)
                .await
                .context("Failed to build index")?;
            info!("Index ready with {} chunks", store.count().await?);
        }
        Command::Ask => {
            let pipeline = RagPipeline::from_config(&config)
                .await
                .context("Failed to initialize RAG pipeline")?;
            pipeline.run_query_loop().await.context("Error in query loop")?;
        }
    }

    Ok(())
}
