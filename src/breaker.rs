//! Circuit breaker guarding calls to flaky external services.
//!
//! # States
//! - **Closed**: calls pass through; a success resets the failure counter.
//! - **Open**: entered once consecutive failures reach the threshold; calls are
//!   rejected without being attempted (or answered with the caller's fallback).
//! - **HalfOpen**: entered lazily, on the first state read after the recovery
//!   window has elapsed since opening. One probe call is admitted; success closes
//!   the breaker, failure re-opens it and restarts the window.
//!
//! Every transition is written to `circuit_breaker_state` under the breaker's
//! mutex, so a restarted process resumes where the previous one left off.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::config::BreakerConfig;
use crate::db::{self, ConnectionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BreakerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("unknown breaker state: {s}")),
        }
    }
}

/// What [`CircuitBreaker::call`] returns when the breaker rejects the call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback<T> {
    /// Reject with [`CircuitBreakerOpen`].
    None,
    /// Return this value instead of failing.
    Value(T),
}

/// The guarded call was not attempted because the breaker is open.
#[derive(Debug, Error)]
#[error("circuit breaker '{name}' is open ({failure_count} consecutive failures)")]
pub struct CircuitBreakerOpen {
    pub name: String,
    pub failure_count: u32,
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&BreakerConfig> for BreakerPolicy {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
        }
    }
}

/// Snapshot of a breaker, as shown by `mnemos breaker status`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<String>,
    pub opened_at: Option<String>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

enum Admission {
    Allowed,
    Rejected(u32),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: BreakerPolicy,
    pool: Arc<ConnectionPool>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Load the breaker's persisted state, starting closed if it has none.
    pub fn load(name: &str, policy: BreakerPolicy, pool: Arc<ConnectionPool>) -> Result<Self> {
        let row: Option<(String, u32, Option<String>, Option<String>)> = {
            let conn = pool.get_connection()?;
            let found = conn
                .query_row(
                    "SELECT state, failure_count, last_failure_at, opened_at \
                     FROM circuit_breaker_state WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            found
        };

        let inner = match row {
            Some((state, failure_count, last_failure_at, opened_at)) => {
                let state = state.parse().unwrap_or_else(|e: String| {
                    tracing::warn!(breaker = %name, error = %e, "resetting unreadable breaker state");
                    BreakerState::Closed
                });
                Inner {
                    state,
                    failure_count,
                    last_failure_at: last_failure_at.as_deref().and_then(db::parse_timestamp),
                    opened_at: opened_at.as_deref().and_then(db::parse_timestamp),
                    probe_in_flight: false,
                }
            }
            None => Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            },
        };

        tracing::debug!(breaker = %name, state = %inner.state, failures = inner.failure_count, "breaker loaded");
        Ok(Self {
            name: name.to_string(),
            policy,
            pool,
            inner: Mutex::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> BreakerPolicy {
        self.policy
    }

    /// Current state, moving an expired open breaker to half-open first.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock_inner().failure_count
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at.map(db::format_timestamp),
            opened_at: inner.opened_at.map(db::format_timestamp),
        }
    }

    /// Run `f` through the breaker.
    ///
    /// When the breaker is open, `f` is not invoked: the fallback value is returned
    /// if one was supplied, otherwise a [`CircuitBreakerOpen`] error. Errors from
    /// `f` are recorded as failures and returned unchanged; panics are recorded
    /// and resumed.
    pub fn call<T, F>(&self, f: F, fallback: Fallback<T>) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Admission::Rejected(failure_count) = self.admit() {
            return match fallback {
                Fallback::Value(value) => {
                    tracing::debug!(breaker = %self.name, "breaker open, returning fallback");
                    Ok(value)
                }
                Fallback::None => Err(CircuitBreakerOpen {
                    name: self.name.clone(),
                    failure_count,
                }
                .into()),
            };
        }

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(e)
            }
            Err(payload) => {
                self.record_failure();
                panic::resume_unwind(payload)
            }
        }
    }

    /// Record a successful call: close the breaker and reset the counter.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;
        if inner.state == BreakerState::Closed && inner.failure_count == 0 {
            return;
        }
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, from = %inner.state, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        self.persist(&inner);
    }

    /// Record a failed call, opening the breaker at the threshold or re-opening
    /// it when a half-open probe fails.
    pub fn record_failure(&self) {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);

        let now = Utc::now();
        inner.probe_in_flight = false;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);

        match inner.state {
            BreakerState::Closed if inner.failure_count >= self.policy.failure_threshold => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit breaker opened"
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
            }
            BreakerState::HalfOpen => {
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "recovery probe failed, circuit breaker re-opened"
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
            }
            _ => {}
        }
        self.persist(&inner);
    }

    /// Force the breaker closed with a zero failure count.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
        self.persist(&inner);
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => Admission::Rejected(inner.failure_count),
            BreakerState::HalfOpen if inner.probe_in_flight => {
                Admission::Rejected(inner.failure_count)
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Admission::Allowed
            }
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| Utc::now().signed_duration_since(opened))
            .and_then(|d| d.to_std().ok());
        // A missing or future opened_at counts as fully elapsed.
        if elapsed.is_some_and(|d| d < self.policy.recovery_timeout) {
            return;
        }
        tracing::info!(breaker = %self.name, "circuit breaker half-open, next call is a probe");
        inner.state = BreakerState::HalfOpen;
        inner.probe_in_flight = false;
        self.persist(inner);
    }

    fn persist(&self, inner: &Inner) {
        let result = self.pool.get_connection().map_err(anyhow::Error::from).and_then(|conn| {
            conn.execute(
                "INSERT INTO circuit_breaker_state \
                 (name, state, failure_count, last_failure_at, opened_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(name) DO UPDATE SET \
                   state = excluded.state, \
                   failure_count = excluded.failure_count, \
                   last_failure_at = excluded.last_failure_at, \
                   opened_at = excluded.opened_at, \
                   updated_at = excluded.updated_at",
                params![
                    self.name,
                    inner.state.as_str(),
                    inner.failure_count,
                    inner.last_failure_at.map(db::format_timestamp),
                    inner.opened_at.map(db::format_timestamp),
                    db::now_timestamp(),
                ],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::error!(breaker = %self.name, error = %e, "failed to persist breaker state");
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Name → breaker map, so every lookup of a name shares one instance.
pub struct BreakerRegistry {
    pool: Arc<ConnectionPool>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the breaker called `name`, loading it on first request.
    /// A breaker keeps the policy it was first created with.
    pub fn get_or_create(&self, name: &str, policy: BreakerPolicy) -> Result<Arc<CircuitBreaker>> {
        let mut breakers = self.lock_breakers();
        if let Some(breaker) = breakers.get(name) {
            return Ok(Arc::clone(breaker));
        }
        let breaker = Arc::new(CircuitBreaker::load(name, policy, Arc::clone(&self.pool))?);
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        Ok(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock_breakers().get(name).cloned()
    }

    /// Every persisted breaker row, read as stored. Nothing is registered and
    /// an expired open breaker is not moved to half-open.
    pub fn stored_statuses(&self) -> Result<Vec<BreakerStatus>> {
        let conn = self.pool.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT name, state, failure_count, last_failure_at, opened_at \
             FROM circuit_breaker_state ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(name, state, failure_count, last_failure_at, opened_at)| {
                let state = state.parse().unwrap_or_else(|e: String| {
                    tracing::warn!(breaker = %name, error = %e, "unreadable stored breaker state");
                    BreakerState::Closed
                });
                BreakerStatus {
                    name,
                    state,
                    failure_count,
                    last_failure_at,
                    opened_at,
                }
            })
            .collect())
    }

    /// Reset a breaker that is registered or has persisted state. Unknown
    /// names are an error, so a typo never creates a new row.
    pub fn reset(&self, name: &str, policy: BreakerPolicy) -> Result<Arc<CircuitBreaker>> {
        let known = self.get(name).is_some()
            || self.stored_statuses()?.iter().any(|status| status.name == name);
        if !known {
            bail!("unknown circuit breaker: {name}");
        }
        let breaker = self.get_or_create(name, policy)?;
        breaker.reset();
        Ok(breaker)
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> =
            self.lock_breakers().values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_pool() -> (TempDir, Arc<ConnectionPool>) {
        let dir = TempDir::new().unwrap();
        let pool = db::open_pool(dir.path().join("breaker.db"), PoolConfig::default()).unwrap();
        (dir, pool)
    }

    fn policy(threshold: u32, recovery_ms: u64) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        let result: Result<()> = breaker.call(|| anyhow::bail!("backend down"), Fallback::None);
        assert!(result.is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(3, 60_000), pool).unwrap();

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.failure_count(), 2);

        let value = breaker.call(|| Ok(7), Fallback::None).unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_breaker_returns_fallback_without_calling() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(3, 60_000), pool).unwrap();
        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicUsize::new(0);
        let value = breaker
            .call(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh")
                },
                Fallback::Value("cached"),
            )
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn open_breaker_without_fallback_reports_failure_count() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(2, 60_000), pool).unwrap();
        fail(&breaker);
        fail(&breaker);

        let err = breaker.call(|| Ok(()), Fallback::None).unwrap_err();
        let open = err.downcast_ref::<CircuitBreakerOpen>().unwrap();
        assert_eq!(open.failure_count, 2);
        assert_eq!(open.name, "llm");
    }

    #[test]
    fn inner_error_is_returned_unchanged() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(5, 60_000), pool).unwrap();

        let err = breaker
            .call::<(), _>(|| Err(std::io::Error::other("socket closed").into()), Fallback::None)
            .unwrap_err();
        assert!(err.downcast_ref::<std::io::Error>().is_some());
        assert!(err.downcast_ref::<CircuitBreakerOpen>().is_none());
    }

    #[test]
    fn half_open_probe_success_closes() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(1, 50), pool).unwrap();
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.call(|| Ok(()), Fallback::None).unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(1, 50), pool).unwrap();
        fail(&breaker);
        let first_opened = breaker.status().opened_at.unwrap();

        std::thread::sleep(Duration::from_millis(80));
        fail(&breaker);

        let status = breaker.status();
        assert_eq!(status.state, BreakerState::Open);
        assert_eq!(status.failure_count, 2);
        assert!(status.opened_at.unwrap() > first_opened);
    }

    #[test]
    fn state_survives_reload() {
        let (_dir, pool) = test_pool();
        {
            let breaker = CircuitBreaker::load("llm", policy(2, 60_000), Arc::clone(&pool)).unwrap();
            fail(&breaker);
            fail(&breaker);
        }

        let reloaded = CircuitBreaker::load("llm", policy(2, 60_000), pool).unwrap();
        assert_eq!(reloaded.state(), BreakerState::Open);
        assert_eq!(reloaded.failure_count(), 2);
    }

    #[test]
    fn panic_in_call_is_recorded() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(5, 60_000), pool).unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = breaker.call(|| panic!("boom"), Fallback::None);
        }));
        assert!(outcome.is_err());
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn registry_shares_instances() {
        let (_dir, pool) = test_pool();
        let registry = BreakerRegistry::new(pool);

        let a = registry.get_or_create("llm", policy(3, 60_000)).unwrap();
        let b = registry.get_or_create("llm", policy(9, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.policy().failure_threshold, 3);
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn stored_statuses_list_rows_without_registering() {
        let (_dir, pool) = test_pool();
        {
            let registry = BreakerRegistry::new(Arc::clone(&pool));
            let breaker = registry.get_or_create("embeddings", policy(3, 60_000)).unwrap();
            fail(&breaker);
        }

        let registry = BreakerRegistry::new(pool);
        let stored = registry.stored_statuses().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "embeddings");
        assert_eq!(stored[0].state, BreakerState::Closed);
        assert_eq!(stored[0].failure_count, 1);
        assert!(stored[0].last_failure_at.is_some());
        assert!(registry.get("embeddings").is_none());
        assert!(registry.statuses().is_empty());
    }

    #[test]
    fn reset_rejects_unknown_names() {
        let (_dir, pool) = test_pool();
        let registry = BreakerRegistry::new(Arc::clone(&pool));
        let breaker = registry.get_or_create("llm", policy(1, 60_000)).unwrap();
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = registry.reset("lml", BreakerPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("unknown circuit breaker"));
        assert_eq!(registry.stored_statuses().unwrap().len(), 1);

        // A fresh registry only knows the name from its stored row.
        let registry = BreakerRegistry::new(pool);
        let reset = registry.reset("llm", BreakerPolicy::default()).unwrap();
        assert_eq!(reset.state(), BreakerState::Closed);
        assert_eq!(registry.stored_statuses().unwrap()[0].state, BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_one_trial_call() {
        let (_dir, pool) = test_pool();
        let breaker = Arc::new(CircuitBreaker::load("llm", policy(1, 200), pool).unwrap());
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let trial = {
            let breaker = Arc::clone(&breaker);
            std::thread::spawn(move || {
                breaker.call(
                    || {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok("trial")
                    },
                    Fallback::None,
                )
            })
        };
        entered_rx.recv().unwrap();

        let calls = AtomicUsize::new(0);
        let concurrent = breaker.call(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("second")
            },
            Fallback::Value("fallback"),
        );
        assert_eq!(concurrent.unwrap(), "fallback");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let rejected: Result<&str> = breaker.call(|| Ok("third"), Fallback::None);
        assert!(rejected.unwrap_err().is::<CircuitBreakerOpen>());

        release_tx.send(()).unwrap();
        assert_eq!(trial.join().unwrap().unwrap(), "trial");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn panicking_trial_call_reopens() {
        let (_dir, pool) = test_pool();
        let breaker = CircuitBreaker::load("llm", policy(1, 200), pool).unwrap();
        fail(&breaker);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            breaker.call(|| -> Result<()> { panic!("trial call blew up") }, Fallback::None)
        }));
        assert!(outcome.is_err());
        assert_eq!(breaker.status().state, BreakerState::Open);
        assert_eq!(breaker.failure_count(), 2);

        // The in-flight flag was cleared; once recovered, a new trial call runs.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(breaker.call(|| Ok(1), Fallback::None).unwrap(), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
