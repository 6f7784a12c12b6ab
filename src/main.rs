mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mnemos::config::MnemosConfig;

#[derive(Parser)]
#[command(name = "mnemos", version, about = "Concurrency and lifecycle tooling for a persistent AI memory store")]
struct Cli {
    /// Config file (default: ~/.mnemos/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a session transcript for consolidation
    Enqueue {
        session_id: String,
        session_path: PathBuf,
    },
    /// Run the consolidation worker
    Work {
        /// Sessions to process per batch
        #[arg(long)]
        max_sessions: Option<usize>,
        /// Per-session timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep polling the queue instead of exiting after one batch
        #[arg(long)]
        daemon: bool,
    },
    /// Inspect and manage the consolidation queue
    Queue {
        #[command(subcommand)]
        action: cli::queue::QueueAction,
    },
    /// Inspect and reset circuit breakers
    Breaker {
        #[command(subcommand)]
        action: cli::breaker::BreakerAction,
    },
    /// Inspect memory reference counts
    Refs {
        #[command(subcommand)]
        action: cli::refs::RefsAction,
    },
    /// Inspect the event log
    Events {
        #[command(subcommand)]
        action: cli::events::EventsAction,
    },
    /// Run database diagnostics
    Doctor,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MnemosConfig::load_from(path)?,
        None => MnemosConfig::load()?,
    };

    // Logs go to stderr so command output on stdout stays clean.
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Enqueue {
            session_id,
            session_path,
        } => cli::enqueue::enqueue(config, &session_id, &session_path),
        Command::Work {
            max_sessions,
            timeout,
            daemon,
        } => cli::work::work(config, max_sessions, timeout, daemon),
        Command::Queue { action } => cli::queue::run(config, action),
        Command::Breaker { action } => cli::breaker::run(config, action),
        Command::Refs { action } => cli::refs::run(config, action),
        Command::Events { action } => cli::events::run(config, action),
        Command::Doctor => cli::doctor::doctor(config),
    }
}
