use clap::{Parser, Subcommand};
use inbox_rag::Result;
use inbox_rag::commands::{ask, index_mailbox, search, show_status};
use inbox_rag::config::{resolve_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "inbox-rag")]
#[command(about = "Ask questions about your email and get answers with sources")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the index (default: ~/.inbox-rag)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Configure embedding, retrieval and generation settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Build or refresh the index from a mailbox export (.json or .jsonl)
    Index {
        /// Path to the mailbox export
        path: PathBuf,
        /// Delete the existing index first
        #[arg(long)]
        rebuild: bool,
    },
    /// Ask a question about your emails
    Ask {
        question: String,
        /// Number of emails to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Show the emails most relevant to a query
    Search {
        query: String,
        /// Number of emails to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Show the state of the index
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = resolve_config_dir(cli.config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Index { path, rebuild } => {
            index_mailbox(&config_dir, &path, rebuild).await?;
        }
        Commands::Ask { question, top_k } => {
            ask(&config_dir, &question, top_k).await?;
        }
        Commands::Search { query, top_k } => {
            search(&config_dir, &query, top_k).await?;
        }
        Commands::Status => {
            show_status(&config_dir).await?;
        }
    }

    Ok(())
}
