//! Bounded pool of SQLite connections shared across threads.
//!
//! [`ConnectionPool::get_connection`] hands out a [`PooledConnection`] guard that
//! dereferences to a [`rusqlite::Connection`]. Dropping the guard rolls back any
//! transaction the borrower left open and returns the connection to the pool, on
//! every exit path. The pool mutex only guards bookkeeping; queries run on the
//! borrowed connection without holding it.

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::PoolConfig;

/// Successive waits while the pool is exhausted. The last step repeats.
const WAIT_BACKOFF: [Duration; 5] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {waited:?} waiting for a database connection ({outstanding} outstanding)")]
    Timeout { outstanding: usize, waited: Duration },
    #[error("failed to open database at {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to configure connection to {path}")]
    Setup {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to prepare database directory {path}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    pub(crate) fn directory(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Directory {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub created: usize,
    pub idle: usize,
    pub outstanding: usize,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<Connection>,
    created: usize,
    /// Bumped by `close_all`; connections from older generations are closed on return.
    generation: u64,
}

#[derive(Debug)]
pub struct ConnectionPool {
    path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened lazily on demand.
    pub fn new(path: impl Into<PathBuf>, config: PoolConfig) -> Self {
        Self {
            path: path.into(),
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
                generation: 0,
            }),
            returned: Condvar::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow a connection, opening a new one if under capacity, otherwise
    /// waiting with backoff until one is returned or the pool timeout elapses.
    pub fn get_connection(&self) -> Result<PooledConnection<'_>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut attempt = 0usize;
        let mut state = self.lock_state();

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                    generation: state.generation,
                });
            }

            if state.created < self.config.size {
                state.created += 1;
                let generation = state.generation;
                drop(state);

                return match self.connect() {
                    Ok(conn) => Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                        generation,
                    }),
                    Err(e) => {
                        let mut state = self.lock_state();
                        if state.generation == generation {
                            state.created -= 1;
                        }
                        drop(state);
                        self.returned.notify_one();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                let outstanding = state.created - state.idle.len();
                tracing::warn!(
                    path = %self.path.display(),
                    outstanding,
                    size = self.config.size,
                    "connection pool exhausted"
                );
                return Err(PoolError::Timeout {
                    outstanding,
                    waited: started.elapsed(),
                });
            }

            let step = WAIT_BACKOFF[attempt.min(WAIT_BACKOFF.len() - 1)];
            attempt += 1;
            let (guard, _) = self
                .returned
                .wait_timeout(state, step.min(deadline - now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Close every idle connection and reset bookkeeping. Connections still
    /// borrowed are closed when their guards drop instead of being re-pooled.
    pub fn close_all(&self) {
        let drained = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.created = 0;
            std::mem::take(&mut state.idle)
        };
        let closed = drained.len();
        for conn in drained {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "failed to close pooled connection");
            }
        }
        self.returned.notify_all();
        tracing::info!(path = %self.path.display(), closed, "connection pool closed");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock_state();
        PoolStatus {
            size: self.config.size,
            created: state.created,
            idle: state.idle.len(),
            outstanding: state.created - state.idle.len(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<Connection, PoolError> {
        let conn = Connection::open(&self.path).map_err(|source| PoolError::Open {
            path: self.path.clone(),
            source,
        })?;
        configure(&conn, &self.config).map_err(|source| PoolError::Setup {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "opened pooled connection");
        Ok(conn)
    }

    fn release(&self, conn: Connection, generation: u64) {
        let clean = conn.is_autocommit() || match conn.execute_batch("ROLLBACK") {
            Ok(()) => {
                tracing::debug!("rolled back transaction left open by previous borrower");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding connection after failed rollback");
                false
            }
        };

        let mut state = self.lock_state();
        if state.generation != generation {
            drop(state);
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "failed to close connection from a closed pool");
            }
            return;
        }
        if clean {
            state.idle.push(conn);
        } else {
            state.created -= 1;
        }
        drop(state);
        self.returned.notify_one();
    }
}

/// One-time setup applied to every new connection.
fn configure(conn: &Connection, config: &PoolConfig) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "database did not switch to WAL mode");
    }
    conn.pragma_update(None, "cache_size", -config.cache_size_kib)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}

/// Exclusive handle to a pooled connection; returned to the pool on drop.
#[derive(Debug)]
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    generation: u64,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation);
        }
    }
}

/// One pool per database file, keyed by resolved absolute path.
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PathBuf, Arc<ConnectionPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pool for `path`, opening it (and initializing the schema) on first use.
    pub fn get_or_open(&self, path: &Path, config: &PoolConfig) -> Result<Arc<ConnectionPool>> {
        let resolved = resolve_path(path)?;
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&resolved) {
            return Ok(Arc::clone(pool));
        }
        let pool = super::open_pool(&resolved, config.clone())?;
        pools.insert(resolved, Arc::clone(&pool));
        Ok(pool)
    }

    /// Close every registered pool. Used at process shutdown.
    pub fn close_all(&self) {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        for pool in pools.values() {
            pool.close_all();
        }
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Absolute path with a canonical parent directory (created if missing).
fn resolve_path(path: &Path) -> Result<PathBuf, PoolError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(PoolError::directory(Path::new(".")))?
            .join(path)
    };

    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => {
            std::fs::create_dir_all(parent).map_err(PoolError::directory(parent))?;
            let parent = parent.canonicalize().map_err(PoolError::directory(parent))?;
            Ok(parent.join(name))
        }
        _ => Ok(absolute),
    }
}
