use anyhow::Result;
use clap::Subcommand;

use mnemos::config::MnemosConfig;
use mnemos::queue::QueueStatus;
use mnemos::runtime::Runtime;

#[derive(Subcommand)]
pub enum QueueAction {
    /// Show queue depth by status
    Stats,
    /// List queue entries
    List {
        /// Only show entries with this status
        #[arg(long)]
        status: Option<QueueStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reset a session to pending with a fresh retry budget
    Retry { session_id: String },
    /// Delete finished entries older than the given age
    Cleanup {
        /// Age in days (default: [queue] cleanup_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

pub fn run(config: MnemosConfig, action: QueueAction) -> Result<()> {
    let cleanup_days = config.queue.cleanup_days;
    let runtime = Runtime::open(config)?;
    let queue = runtime.queue();

    match action {
        QueueAction::Stats => {
            let stats = queue.stats()?;
            println!("Consolidation Queue");
            println!("{}", "=".repeat(40));
            println!("  Pending:             {}", stats.pending);
            println!("  Processing:          {}", stats.processing);
            println!("  Completed:           {}", stats.completed);
            println!("  Failed:              {}", stats.failed);
            println!("  Abandoned:           {}", stats.abandoned);
            if let Some(ref oldest) = stats.oldest_pending {
                println!("  Oldest pending:      {oldest}");
            }
        }
        QueueAction::List { status, limit } => {
            let entries = queue.list(status, limit)?;
            if entries.is_empty() {
                println!("No queue entries.");
            }
            for entry in entries {
                println!(
                    "{:<36} {:<10} retries={} added={}",
                    entry.session_id, entry.status.as_str(), entry.retry_count, entry.added_at
                );
                if let Some(ref next) = entry.next_retry_at {
                    println!("{:<36} next retry {next}", "");
                }
                if let Some(ref error) = entry.error_message {
                    println!("{:<36} error: {error}", "");
                }
            }
        }
        QueueAction::Retry { session_id } => {
            if queue.requeue(&session_id)? {
                println!("Requeued {session_id}");
            } else {
                anyhow::bail!("no queue entry for session {session_id}");
            }
        }
        QueueAction::Cleanup { days } => {
            let days = days.unwrap_or(cleanup_days);
            let deleted = queue.cleanup_old(days)?;
            println!("Removed {deleted} entries finished more than {days} day(s) ago");
        }
    }

    runtime.shutdown();
    Ok(())
}
