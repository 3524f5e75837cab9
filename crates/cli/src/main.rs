//! Tierwise CLI — the main entry point.
//!
//! Commands:
//! - `onboard`     — Write a default config
//! - `chunk`       — Show how a file would be chunked
//! - `ingest`      — Store text in a conversation's memory
//! - `search`      — Semantic search over stored memory
//! - `stats`       — Memory counts and token totals
//! - `consolidate` — Fold old short-term memory into long-term summaries
//! - `servers`     — List tool servers and their health
//! - `ask`         — Run one turn against memory and tools
//! - `doctor`      — Diagnose configuration and index

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierwise_config::AppConfig;

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "tierwise",
    about = "Tierwise — tiered conversational memory and tool dispatch",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.tierwise/config.toml
    #[arg(long, global = true, env = "TIERWISE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Onboard {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show how a file would be chunked
    Chunk(commands::chunk::ChunkArgs),

    /// Store text in a conversation's memory
    Ingest(commands::memory::IngestArgs),

    /// Semantic search over stored memory
    Search(commands::memory::SearchArgs),

    /// Memory counts and token totals
    Stats {
        /// Only this user's conversations
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Consolidate conversations that are over their bounds
    Consolidate(commands::memory::ConsolidateArgs),

    /// List tool servers and their health
    Servers {
        /// Ask each server for its tools
        #[arg(long)]
        discover: bool,

        /// Emit JSON
        #[arg(long)]
        json: bool,

        /// Keep running and show the table again whenever the servers file changes
        #[arg(long, conflicts_with_all = ["discover", "json"])]
        watch: bool,
    },

    /// Answer one message from memory, optionally calling tools first
    Ask(commands::ask::AskArgs),

    /// Diagnose configuration and index health
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Doctor reports config problems itself instead of failing on them.
    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging, cli.verbose);

    match cli.command {
        Commands::Onboard { force } => commands::onboard::run(cli.config.as_deref(), force)?,
        Commands::Doctor => commands::doctor::run(cli.config.as_deref(), loaded)?,
        Commands::Chunk(args) => commands::chunk::run(&loaded?, args)?,
        Commands::Ingest(args) => commands::memory::ingest(loaded?, args).await?,
        Commands::Search(args) => commands::memory::search(loaded?, args).await?,
        Commands::Stats { user } => commands::memory::stats(loaded?, user)?,
        Commands::Consolidate(args) => commands::memory::consolidate(loaded?, args).await?,
        Commands::Servers {
            discover,
            json,
            watch,
        } => commands::servers::run(loaded?, discover, json, watch).await?,
        Commands::Ask(args) => commands::ask::run(loaded?, args).await?,
    }

    Ok(())
}

fn init_tracing(logging: &tierwise_config::LoggingConfig, verbose: bool) {
    let filter = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
