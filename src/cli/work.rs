use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mnemos::config::MnemosConfig;
use mnemos::queue::consolidator::CommandConsolidator;
use mnemos::queue::worker::{SessionOutcome, WorkerSettings};
use mnemos::runtime::Runtime;

/// Run one worker batch, or poll forever with `--daemon`.
pub fn work(
    config: MnemosConfig,
    max_sessions: Option<usize>,
    timeout_secs: Option<u64>,
    daemon: bool,
) -> Result<()> {
    let consolidator = Arc::new(CommandConsolidator::from_config(&config.consolidator)?);

    let mut settings = WorkerSettings::from_config(&config);
    if let Some(max) = max_sessions {
        settings.max_sessions = max;
    }
    if let Some(secs) = timeout_secs {
        settings.timeout_per_session = Duration::from_secs(secs);
    }

    let runtime = Runtime::open(config)?;
    let worker = runtime.worker(consolidator, settings)?;

    if daemon {
        // SIGINT/SIGTERM let the current session finish, then stop claiming.
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            flag.store(true, Ordering::Relaxed);
        })
        .context("failed to install shutdown signal handler")?;

        let completed = worker.run_forever(&shutdown);
        println!("Completed {completed} session(s)");
        runtime.shutdown();
        return Ok(());
    }

    let report = worker.run_batch()?;

    if report.requeued_stale > 0 {
        println!("Requeued {} stale session(s)", report.requeued_stale);
    }
    if report.abandoned_stale > 0 {
        println!("Abandoned {} stale session(s) out of retries", report.abandoned_stale);
    }
    if report.attempted == 0 {
        println!("No sessions ready for consolidation.");
    }
    for outcome in &report.outcomes {
        match outcome {
            SessionOutcome::Completed { session_id, report } => println!(
                "  [ok]        {session_id}: {} new, {} updated, {} duplicate",
                report.new_count, report.updated_count, report.duplicate_count
            ),
            SessionOutcome::Failed {
                session_id,
                error,
                next_retry_at,
            } => println!(
                "  [failed]    {session_id}: {error} (retry at {})",
                next_retry_at.as_deref().unwrap_or("-")
            ),
            SessionOutcome::Deferred {
                session_id,
                next_retry_at,
            } => println!(
                "  [deferred]  {session_id}: breaker open (retry at {})",
                next_retry_at.as_deref().unwrap_or("-")
            ),
            SessionOutcome::Abandoned {
                session_id,
                error,
                retry_count,
            } => println!("  [abandoned] {session_id}: {error} after {retry_count} retries"),
            SessionOutcome::Superseded { session_id } => {
                println!("  [stale]     {session_id}: claim taken over by another worker, result discarded")
            }
        }
    }
    println!();
    println!(
        "Completed {} of {} session(s) ({} failed, {} deferred, {} abandoned, {} superseded)",
        report.completed,
        report.attempted,
        report.failed,
        report.deferred,
        report.abandoned,
        report.superseded
    );

    runtime.shutdown();
    Ok(())
}
