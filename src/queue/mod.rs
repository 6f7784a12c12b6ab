//! Durable queue of sessions awaiting consolidation.
//!
//! Entry lifecycle:
//!
//! ```text
//! pending ──get_next──▶ processing ──complete_claim──▶ completed
//!    ▲                      │
//!    │                      └──fail_claim───▶ failed ──(next_retry_at passes)──▶ claimable again
//!    │                                          │
//!    └────────────requeue──────────────── abandoned (retry_count reached max_retries)
//! ```
//!
//! [`ConsolidationQueue::add`] is the fast path called when a session ends: a
//! single insert. [`ConsolidationQueue::get_next`] claims the oldest eligible entry
//! with one conditional `UPDATE ... RETURNING` inside an immediate transaction, so
//! two workers can never claim the same session.
//!
//! A worker finishes its claim with [`ConsolidationQueue::complete_claim`],
//! [`ConsolidationQueue::fail_claim`] or [`ConsolidationQueue::defer`]. Each
//! matches on the claim's `started_at`, so once [`ConsolidationQueue::requeue_stale`]
//! has released an entry the original worker's late result changes nothing.

pub mod consolidator;
pub mod worker;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::db::{self, ConnectionPool};
use crate::memory::references::ReferenceCounter;
use consolidator::MemoryReference;

const ENTRY_COLUMNS: &str = "id, session_id, session_path, status, added_at, started_at, \
    completed_at, error_message, retry_count, next_retry_at, abandoned_at";

/// Matches an entry still held by one claim: `?1` session id, `?2` its `started_at`.
const CLAIM_FILTER: &str = "session_id = ?1 AND status = 'processing' AND started_at IS ?2";

const STALE_REASON: &str = "worker stopped while processing";

/// Used when the configured backoff schedule is empty.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Dead letter: retries exhausted, never reclaimed automatically.
    Abandoned,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("unknown queue status: {s}")),
        }
    }
}

/// A row of `consolidation_queue`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub session_id: String,
    pub session_path: String,
    pub status: QueueStatus,
    pub added_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<String>,
    pub abandoned_at: Option<String>,
}

/// What happened to an entry after [`ConsolidationQueue::mark_failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum FailureDisposition {
    Retry {
        retry_count: u32,
        next_retry_at: String,
    },
    Abandoned {
        retry_count: u32,
    },
}

/// Sessions released by [`ConsolidationQueue::requeue_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaleSweep {
    pub requeued: Vec<String>,
    pub abandoned: Vec<String>,
}

impl StaleSweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.abandoned.is_empty()
    }
}

/// Queue depth by status, for health dashboards.
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending: Option<String>,
}

#[derive(Clone)]
pub struct ConsolidationQueue {
    pool: Arc<ConnectionPool>,
    config: QueueConfig,
}

impl ConsolidationQueue {
    pub fn new(pool: Arc<ConnectionPool>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Enqueue a session. Returns `false` if the session is already queued.
    pub fn add(&self, session_id: &str, session_path: &Path) -> Result<bool> {
        let conn = self.pool.get_connection()?;
        let result = conn.execute(
            "INSERT INTO consolidation_queue (session_id, session_path, status, added_at) \
             VALUES (?1, ?2, 'pending', ?3)",
            params![session_id, session_path.to_string_lossy(), db::now_timestamp()],
        );

        match result {
            Ok(_) => {
                tracing::info!(session_id, "session queued for consolidation");
                Ok(true)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                tracing::debug!(session_id, "session already queued");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest eligible entry and mark it `processing`.
    ///
    /// Eligible entries are `pending`, or `failed` with `next_retry_at` in the
    /// past. Retries compete by original enqueue time, not retry time.
    pub fn get_next(&self) -> Result<Option<QueueEntry>> {
        let mut conn = self.pool.get_connection()?;
        let now = db::now_timestamp();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx
            .query_row(
                &format!(
                    "UPDATE consolidation_queue SET status = 'processing', started_at = ?1 \
                     WHERE id = ( \
                       SELECT id FROM consolidation_queue \
                       WHERE status = 'pending' \
                          OR (status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1) \
                       ORDER BY added_at, id LIMIT 1 \
                     ) \
                     RETURNING {ENTRY_COLUMNS}"
                ),
                params![now],
                entry_from_row,
            )
            .optional()?;
        tx.commit()?;

        if let Some(entry) = &claimed {
            tracing::info!(
                session_id = %entry.session_id,
                retry_count = entry.retry_count,
                "claimed session for consolidation"
            );
        }
        Ok(claimed)
    }

    /// Mark an entry completed. Returns `false` if the session is unknown.
    pub fn mark_completed(&self, session_id: &str) -> Result<bool> {
        let conn = self.pool.get_connection()?;
        let updated = conn.execute(
            "UPDATE consolidation_queue \
             SET status = 'completed', completed_at = ?2, error_message = NULL, next_retry_at = NULL \
             WHERE session_id = ?1",
            params![session_id, db::now_timestamp()],
        )?;
        Ok(updated > 0)
    }

    /// Complete a claim returned by [`get_next`](Self::get_next) and apply the
    /// session's memory references in the same transaction.
    ///
    /// Returns `false`, changing nothing, when the entry is no longer held by this
    /// claim (a stale sweep released it and another worker may own it now).
    pub fn complete_claim(&self, claim: &QueueEntry, references: &[MemoryReference]) -> Result<bool> {
        let mut conn = self.pool.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            &format!(
                "UPDATE consolidation_queue \
                 SET status = 'completed', completed_at = ?3, error_message = NULL, next_retry_at = NULL \
                 WHERE {CLAIM_FILTER}"
            ),
            params![claim.session_id, claim.started_at, db::now_timestamp()],
        )?;
        if updated == 0 {
            tracing::warn!(session_id = %claim.session_id, "claim lost before completion");
            return Ok(false);
        }

        for reference in references {
            ReferenceCounter::increment_in(&tx, &reference.memory_id, reference.ref_type)?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count` and schedules the next attempt `retry_in` from now,
    /// or per the backoff schedule when `retry_in` is `None`. Once `retry_count`
    /// reaches `max_retries` (when non-zero) the entry is abandoned instead.
    pub fn mark_failed(
        &self,
        session_id: &str,
        error_message: &str,
        retry_in: Option<Duration>,
    ) -> Result<FailureDisposition> {
        self.record_failure(session_id, None, error_message, retry_in)?
            .ok_or_else(|| anyhow!("session not queued: {session_id}"))
    }

    /// [`mark_failed`](Self::mark_failed) for a claim returned by
    /// [`get_next`](Self::get_next). Returns `None`, changing nothing, when the
    /// claim has been lost.
    pub fn fail_claim(
        &self,
        claim: &QueueEntry,
        error_message: &str,
        retry_in: Option<Duration>,
    ) -> Result<Option<FailureDisposition>> {
        self.record_failure(&claim.session_id, Some(claim), error_message, retry_in)
    }

    fn record_failure(
        &self,
        session_id: &str,
        claim: Option<&QueueEntry>,
        error_message: &str,
        retry_in: Option<Duration>,
    ) -> Result<Option<FailureDisposition>> {
        let mut conn = self.pool.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: Option<u32> = match claim {
            None => tx
                .query_row(
                    "SELECT retry_count FROM consolidation_queue WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?,
            Some(claim) => tx
                .query_row(
                    &format!("SELECT retry_count FROM consolidation_queue WHERE {CLAIM_FILTER}"),
                    params![session_id, claim.started_at],
                    |row| row.get(0),
                )
                .optional()?,
        };
        let Some(previous) = previous else {
            if claim.is_some() {
                tracing::warn!(session_id, "claim lost before failure was recorded");
            }
            return Ok(None);
        };

        let retry_count = previous.saturating_add(1);
        let now = Utc::now();
        let now_str = db::format_timestamp(now);

        let disposition = if self.config.max_retries > 0 && retry_count >= self.config.max_retries {
            tx.execute(
                "UPDATE consolidation_queue \
                 SET status = 'abandoned', retry_count = ?2, error_message = ?3, \
                     completed_at = ?4, abandoned_at = ?4, next_retry_at = NULL \
                 WHERE session_id = ?1",
                params![session_id, retry_count, error_message, now_str],
            )?;
            tracing::error!(session_id, retry_count, error = error_message, "session abandoned after repeated failures");
            FailureDisposition::Abandoned { retry_count }
        } else {
            let delay = retry_in.unwrap_or_else(|| self.backoff_delay(retry_count));
            let next_retry_at = db::format_timestamp(now + to_chrono(delay));
            tx.execute(
                "UPDATE consolidation_queue \
                 SET status = 'failed', retry_count = ?2, error_message = ?3, \
                     completed_at = ?4, next_retry_at = ?5 \
                 WHERE session_id = ?1",
                params![session_id, retry_count, error_message, now_str, next_retry_at],
            )?;
            tracing::warn!(
                session_id,
                retry_count,
                next_retry_at = %next_retry_at,
                error = error_message,
                "session consolidation failed"
            );
            FailureDisposition::Retry {
                retry_count,
                next_retry_at,
            }
        };

        tx.commit()?;
        Ok(Some(disposition))
    }

    /// Put a claimed entry back for later without consuming a retry attempt.
    /// Returns `false` when the claim has been lost.
    pub fn defer(&self, claim: &QueueEntry, delay: Duration, reason: &str) -> Result<bool> {
        let conn = self.pool.get_connection()?;
        let next_retry_at = db::format_timestamp(Utc::now() + to_chrono(delay));
        let updated = conn.execute(
            &format!(
                "UPDATE consolidation_queue \
                 SET status = 'failed', error_message = ?3, next_retry_at = ?4 \
                 WHERE {CLAIM_FILTER}"
            ),
            params![claim.session_id, claim.started_at, reason, next_retry_at],
        )?;
        if updated > 0 {
            tracing::info!(session_id = %claim.session_id, next_retry_at = %next_retry_at, reason, "session deferred");
        }
        Ok(updated > 0)
    }

    /// Reset an entry (typically abandoned) to `pending` with a fresh retry budget.
    pub fn requeue(&self, session_id: &str) -> Result<bool> {
        let conn = self.pool.get_connection()?;
        let updated = conn.execute(
            "UPDATE consolidation_queue \
             SET status = 'pending', retry_count = 0, started_at = NULL, completed_at = NULL, \
                 error_message = NULL, next_retry_at = NULL, abandoned_at = NULL \
             WHERE session_id = ?1",
            params![session_id],
        )?;
        if updated > 0 {
            tracing::info!(session_id, "session requeued");
        }
        Ok(updated > 0)
    }

    /// Release entries stuck in `processing` longer than `max_age`.
    ///
    /// A stuck entry means its worker died, so the sweep counts as a failed
    /// attempt: `retry_count` goes up, and entries that reach `max_retries` are
    /// abandoned instead of returning to `pending`.
    pub fn requeue_stale(&self, max_age: Duration) -> Result<StaleSweep> {
        let mut conn = self.pool.get_connection()?;
        let now = Utc::now();
        let now_str = db::format_timestamp(now);
        let cutoff = db::format_timestamp(now - to_chrono(max_age));

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sweep = {
            let abandoned = if self.config.max_retries > 0 {
                let mut stmt = tx.prepare(
                    "UPDATE consolidation_queue \
                     SET status = 'abandoned', retry_count = retry_count + 1, error_message = ?2, \
                         started_at = NULL, completed_at = ?3, abandoned_at = ?3, next_retry_at = NULL \
                     WHERE status = 'processing' AND started_at < ?1 AND retry_count + 1 >= ?4 \
                     RETURNING session_id",
                )?;
                let ids = stmt
                    .query_map(
                        params![cutoff, STALE_REASON, now_str, self.config.max_retries],
                        |row| row.get(0),
                    )?
                    .collect::<Result<Vec<String>, _>>()?;
                ids
            } else {
                Vec::new()
            };

            let mut stmt = tx.prepare(
                "UPDATE consolidation_queue \
                 SET status = 'pending', retry_count = retry_count + 1, error_message = ?2, \
                     started_at = NULL \
                 WHERE status = 'processing' AND started_at < ?1 \
                 RETURNING session_id",
            )?;
            let requeued = stmt
                .query_map(params![cutoff, STALE_REASON], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            StaleSweep { requeued, abandoned }
        };
        tx.commit()?;

        if !sweep.is_empty() {
            tracing::warn!(
                requeued = sweep.requeued.len(),
                abandoned = sweep.abandoned.len(),
                "recovered sessions orphaned in processing"
            );
        }
        Ok(sweep)
    }

    /// Delete `completed` and `failed` entries finished more than `days` ago.
    pub fn cleanup_old(&self, days: u32) -> Result<usize> {
        let conn = self.pool.get_connection()?;
        let cutoff = db::format_timestamp(Utc::now() - chrono::Duration::days(i64::from(days)));
        let deleted = conn.execute(
            "DELETE FROM consolidation_queue \
             WHERE status IN ('completed', 'failed') AND completed_at < ?1",
            params![cutoff],
        )?;
        tracing::info!(deleted, days, "old queue entries removed");
        Ok(deleted)
    }

    pub fn get(&self, session_id: &str) -> Result<Option<QueueEntry>> {
        let conn = self.pool.get_connection()?;
        let entry = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM consolidation_queue WHERE session_id = ?1"),
                params![session_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries in enqueue order, optionally filtered by status.
    pub fn list(&self, status: Option<QueueStatus>, limit: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.pool.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM consolidation_queue \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY added_at, id LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.pool.get_connection()?;
        let rows: Vec<(String, i64)> = {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM consolidation_queue GROUP BY status")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => stats.pending = count,
                Ok(QueueStatus::Processing) => stats.processing = count,
                Ok(QueueStatus::Completed) => stats.completed = count,
                Ok(QueueStatus::Failed) => stats.failed = count,
                Ok(QueueStatus::Abandoned) => stats.abandoned = count,
                Err(e) => tracing::warn!(error = %e, "unexpected queue status"),
            }
        }

        stats.oldest_pending = conn.query_row(
            "SELECT MIN(added_at) FROM consolidation_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(stats)
    }

    /// Retry delay for the given attempt number (1-based), capped at the
    /// last schedule entry.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let schedule = &self.config.backoff_schedule_secs;
        if schedule.is_empty() {
            return DEFAULT_RETRY_DELAY;
        }
        let index = (attempt.max(1) as usize - 1).min(schedule.len() - 1);
        Duration::from_secs(schedule[index])
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(3)?;
    let status = status.parse::<QueueStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(QueueEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        session_path: row.get(2)?,
        status,
        added_at: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        next_retry_at: row.get(9)?,
        abandoned_at: row.get(10)?,
    })
}
