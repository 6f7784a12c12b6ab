//! Worker loop that drains the consolidation queue.
//!
//! Each batch claims up to `max_sessions` entries and runs the consolidator for
//! each one through the reasoning backend's circuit breaker. A failure is recorded
//! against its entry and the batch moves on; only a breaker rejection ends the
//! batch early, since every later entry would be rejected as well.
//!
//! Every write that finishes a session is guarded by the claim it was made
//! under. If the stale sweep handed the session to another worker meanwhile,
//! the late result is dropped and reported as [`SessionOutcome::Superseded`].

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::consolidator::{ConsolidationReport, Consolidator};
use super::{ConsolidationQueue, FailureDisposition, QueueEntry, StaleSweep};
use crate::breaker::{CircuitBreaker, CircuitBreakerOpen, Fallback};
use crate::config::MnemosConfig;
use crate::events::{EventBus, EventType};

/// Upper bound on one uninterrupted sleep in [`Worker::run_forever`].
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum gap between the per-session timeout and the stale-claim age.
pub const STALE_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_sessions: usize,
    pub timeout_per_session: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &MnemosConfig) -> Self {
        Self {
            max_sessions: config.worker.max_sessions,
            timeout_per_session: config.worker.timeout_per_session(),
            poll_interval: config.worker.poll_interval(),
            stale_after: Duration::from_secs(config.queue.stale_after_secs),
        }
    }

    /// A claim may only be swept as stale once its consolidator has surely
    /// been killed, so `stale_after` must exceed the timeout plus
    /// [`STALE_MARGIN`].
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            bail!("worker max_sessions must be at least 1");
        }
        let floor = self.timeout_per_session.saturating_add(STALE_MARGIN);
        if self.stale_after < floor {
            bail!(
                "stale_after ({}s) must be at least timeout_per_session ({}s) plus {}s; \
                 raise [queue] stale_after_secs or lower the timeout",
                self.stale_after.as_secs(),
                self.timeout_per_session.as_secs(),
                STALE_MARGIN.as_secs()
            );
        }
        Ok(())
    }
}

/// What happened to one claimed session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed {
        session_id: String,
        report: ConsolidationReport,
    },
    Failed {
        session_id: String,
        error: String,
        next_retry_at: Option<String>,
    },
    /// The breaker was open; the entry goes back without using a retry.
    Deferred {
        session_id: String,
        next_retry_at: Option<String>,
    },
    Abandoned {
        session_id: String,
        error: String,
        retry_count: u32,
    },
    /// The claim was swept as stale and taken over before this worker
    /// finished; its result was discarded.
    Superseded { session_id: String },
}

impl SessionOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Deferred { session_id, .. }
            | Self::Abandoned { session_id, .. }
            | Self::Superseded { session_id } => session_id,
        }
    }
}

/// Summary of one [`Worker::run_batch`] call.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub run_id: String,
    pub requeued_stale: usize,
    pub abandoned_stale: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub abandoned: usize,
    pub superseded: usize,
    pub outcomes: Vec<SessionOutcome>,
}

impl WorkerReport {
    fn new(run_id: String, sweep: &StaleSweep) -> Self {
        Self {
            run_id,
            requeued_stale: sweep.requeued.len(),
            abandoned_stale: sweep.abandoned.len(),
            attempted: 0,
            completed: 0,
            failed: 0,
            deferred: 0,
            abandoned: 0,
            superseded: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Completed { .. } => self.completed += 1,
            SessionOutcome::Failed { .. } => self.failed += 1,
            SessionOutcome::Deferred { .. } => self.deferred += 1,
            SessionOutcome::Abandoned { .. } => self.abandoned += 1,
            SessionOutcome::Superseded { .. } => self.superseded += 1,
        }
        self.outcomes.push(outcome);
    }
}

pub struct Worker {
    queue: ConsolidationQueue,
    breaker: Arc<CircuitBreaker>,
    events: Arc<EventBus>,
    consolidator: Arc<dyn Consolidator>,
    settings: WorkerSettings,
}

impl Worker {
    /// Fails if `settings` would let the stale sweep reclaim a live session.
    pub fn new(
        queue: ConsolidationQueue,
        breaker: Arc<CircuitBreaker>,
        events: Arc<EventBus>,
        consolidator: Arc<dyn Consolidator>,
        settings: WorkerSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            queue,
            breaker,
            events,
            consolidator,
            settings,
        })
    }

    /// Process up to `max_sessions` queued sessions, then return.
    pub fn run_batch(&self) -> Result<WorkerReport> {
        self.run_batch_until(None)
    }

    fn run_batch_until(&self, shutdown: Option<&AtomicBool>) -> Result<WorkerReport> {
        let run_id = uuid::Uuid::now_v7().to_string();
        let span = tracing::info_span!("worker_batch", run_id = %run_id);
        let _guard = span.enter();
        let started = Instant::now();

        let sweep = self
            .queue
            .requeue_stale(self.settings.stale_after)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to requeue stale sessions");
                StaleSweep::default()
            });
        for session_id in &sweep.abandoned {
            self.publish(
                EventType::SessionAbandoned,
                json!({ "session_id": session_id, "error": "stale claim exhausted its retries" }),
            );
        }
        let mut report = WorkerReport::new(run_id, &sweep);

        while report.attempted < self.settings.max_sessions {
            if shutdown.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                tracing::info!("shutdown requested, not claiming more sessions");
                break;
            }
            let Some(entry) = self.queue.get_next()? else {
                break;
            };
            report.attempted += 1;

            let outcome = self.process(&entry);
            let breaker_open = matches!(outcome, SessionOutcome::Deferred { .. });
            report.record(outcome);
            if breaker_open {
                tracing::warn!(breaker = %self.breaker.name(), "breaker open, ending batch early");
                break;
            }
        }

        tracing::info!(
            attempted = report.attempted,
            completed = report.completed,
            failed = report.failed,
            deferred = report.deferred,
            abandoned = report.abandoned,
            superseded = report.superseded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "worker batch finished"
        );
        Ok(report)
    }

    /// Run batches until `shutdown` is set, sleeping `poll_interval` whenever a
    /// batch finds nothing to do. Returns the number of sessions completed.
    pub fn run_forever(&self, shutdown: &AtomicBool) -> usize {
        let mut completed = 0;
        while !shutdown.load(Ordering::Relaxed) {
            let idle = match self.run_batch_until(Some(shutdown)) {
                Ok(report) => {
                    completed += report.completed;
                    report.attempted == 0 || report.deferred > 0
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "worker batch failed");
                    true
                }
            };
            if idle {
                sleep_unless_shutdown(self.settings.poll_interval, shutdown);
            }
        }
        tracing::info!(completed, "worker stopped");
        completed
    }

    fn process(&self, entry: &QueueEntry) -> SessionOutcome {
        let session_path = Path::new(&entry.session_path);
        let timeout = self.settings.timeout_per_session;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.breaker.call(
                || self.consolidator.consolidate(session_path, timeout),
                Fallback::None,
            )
        }))
        .unwrap_or_else(|payload| Err(anyhow!("consolidator panicked: {}", panic_message(payload.as_ref()))));

        match result {
            Ok(report) => self.complete(entry, report),
            Err(e) if e.is::<CircuitBreakerOpen>() => self.defer(entry, &e),
            Err(e) => self.fail(entry, &e),
        }
    }

    fn complete(&self, entry: &QueueEntry, report: ConsolidationReport) -> SessionOutcome {
        let session_id = entry.session_id.as_str();

        // References and the status change commit together or not at all.
        match self.queue.complete_claim(entry, &report.references) {
            Ok(true) => {}
            Ok(false) => return self.superseded(entry),
            Err(e) => return self.fail(entry, &e.context("failed to record consolidation result")),
        }

        let payload = json!({
            "session_id": session_id,
            "new_count": report.new_count,
            "updated_count": report.updated_count,
            "duplicate_count": report.duplicate_count,
        });
        if report.new_count > 0 {
            self.publish(EventType::MemoryCreated, payload.clone());
        }
        if report.updated_count > 0 {
            self.publish(EventType::MemoryUpdated, payload);
        }

        tracing::info!(
            session_id,
            new = report.new_count,
            updated = report.updated_count,
            duplicates = report.duplicate_count,
            "session consolidated"
        );
        SessionOutcome::Completed {
            session_id: session_id.to_string(),
            report,
        }
    }

    fn defer(&self, entry: &QueueEntry, error: &anyhow::Error) -> SessionOutcome {
        let session_id = entry.session_id.clone();
        let delay = self.queue.backoff_delay(entry.retry_count.saturating_add(1));
        let next_retry_at = match self.queue.defer(entry, delay, &error.to_string()) {
            Ok(false) => return self.superseded(entry),
            Ok(true) => self
                .queue
                .get(&session_id)
                .ok()
                .flatten()
                .and_then(|e| e.next_retry_at),
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "failed to defer session");
                None
            }
        };
        SessionOutcome::Deferred {
            session_id,
            next_retry_at,
        }
    }

    fn fail(&self, entry: &QueueEntry, error: &anyhow::Error) -> SessionOutcome {
        let session_id = entry.session_id.clone();
        let message = format!("{error:#}");

        match self.queue.fail_claim(entry, &message, None) {
            Ok(None) => self.superseded(entry),
            Ok(Some(FailureDisposition::Retry {
                retry_count,
                next_retry_at,
            })) => {
                self.publish(
                    EventType::ConsolidationFailed,
                    json!({
                        "session_id": session_id,
                        "error": message,
                        "retry_count": retry_count,
                        "next_retry_at": next_retry_at,
                    }),
                );
                SessionOutcome::Failed {
                    session_id,
                    error: message,
                    next_retry_at: Some(next_retry_at),
                }
            }
            Ok(Some(FailureDisposition::Abandoned { retry_count })) => {
                self.publish(
                    EventType::SessionAbandoned,
                    json!({
                        "session_id": session_id,
                        "error": message,
                        "retry_count": retry_count,
                    }),
                );
                SessionOutcome::Abandoned {
                    session_id,
                    error: message,
                    retry_count,
                }
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "failed to record session failure");
                SessionOutcome::Failed {
                    session_id,
                    error: message,
                    next_retry_at: None,
                }
            }
        }
    }

    fn superseded(&self, entry: &QueueEntry) -> SessionOutcome {
        tracing::warn!(
            session_id = %entry.session_id,
            claimed_at = entry.started_at.as_deref().unwrap_or("-"),
            "claim was taken over by another worker, discarding result"
        );
        SessionOutcome::Superseded {
            session_id: entry.session_id.clone(),
        }
    }

    fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        if let Err(e) = self.events.publish(event_type, payload) {
            tracing::warn!(event_type = %event_type, error = %e, "failed to publish event");
        }
    }
}

fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_CHECK_INTERVAL));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
