pub mod migrations;
pub mod pool;
pub mod schema;

pub use pool::{ConnectionPool, PoolError, PoolRegistry, PoolStatus, PooledConnection};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::PoolConfig;

/// Open a connection pool for the database at `path`, creating the file and
/// initializing schema and migrations through its first connection.
pub fn open_pool(path: impl AsRef<Path>, config: PoolConfig) -> Result<Arc<ConnectionPool>> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PoolError::directory(parent))?;
    }

    let pool = Arc::new(ConnectionPool::new(path, config));
    {
        let mut conn = pool
            .get_connection()
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        schema::init_schema(&conn).context("failed to initialize schema")?;
        migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(pool)
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Parse a stored timestamp; `None` if it is not valid RFC 3339.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Database health report produced by [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub queue_rows: u64,
    pub breaker_rows: u64,
    pub reference_rows: u64,
    pub event_rows: u64,
}

/// Run `PRAGMA integrity_check` and collect row counts for each component table.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version = migrations::get_schema_version(conn)?;

    let details: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA integrity_check")?;
        let collected = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };
    let integrity_ok = details.len() == 1 && details[0] == "ok";

    let count = |table: &str| -> Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(n as u64)
    };

    Ok(HealthReport {
        schema_version,
        integrity_ok,
        integrity_details: details.join("; "),
        queue_rows: count("consolidation_queue")?,
        breaker_rows: count("circuit_breaker_state")?,
        reference_rows: count("reference_counts")?,
        event_rows: count("memory_events")?,
    })
}
