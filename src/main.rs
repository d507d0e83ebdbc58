mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use worldline::config::AgentConfig;

#[derive(Parser)]
#[command(name = "worldline", version, about = "Conversational agent with an evolving world state")]
struct Cli {
    /// Config file (defaults to ~/.worldline/config.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Worker model, overriding the config file
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Chat interactively (the default)
    Chat,
    /// Search past turns by similarity
    Search {
        query: String,
        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
    },
    /// Show the last saved world state
    State,
    /// Show recent turns
    History {
        /// Number of turns
        #[arg(short, default_value_t = 20)]
        n: usize,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.worldline/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load_from(path)?,
        None => AgentConfig::load()?,
    };
    if let Some(model) = cli.model {
        config.generation.model = model;
    }

    // Logs go to stderr so the chat transcript on stdout stays clean.
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => cli::chat::chat(config).await?,
        Command::Search { query, k } => cli::search::search(&config, &query, k).await?,
        Command::State => cli::state::state(&config)?,
        Command::History { n } => cli::history::history(&config, n)?,
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}
