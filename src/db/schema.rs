//! SQL DDL for all mnemos tables.
//!
//! Defines the `consolidation_queue`, `circuit_breaker_state`, `reference_counts`,
//! `memory_events`, and `schema_meta` tables. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Sessions awaiting or undergoing consolidation
CREATE TABLE IF NOT EXISTS consolidation_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    session_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    added_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_status_added ON consolidation_queue(status, added_at);
CREATE INDEX IF NOT EXISTS idx_queue_next_retry ON consolidation_queue(next_retry_at);

-- Persisted circuit breaker state, one row per named breaker
CREATE TABLE IF NOT EXISTS circuit_breaker_state (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL CHECK(state IN ('closed','open','half_open')),
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_failure_at TEXT,
    opened_at TEXT,
    updated_at TEXT NOT NULL
);

-- Per-memory, per-type reference counters
CREATE TABLE IF NOT EXISTS reference_counts (
    memory_id TEXT NOT NULL,
    ref_type TEXT NOT NULL CHECK(ref_type IN ('relationship','chunk','decision','synthesis')),
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK(ref_count >= 0),
    last_updated TEXT NOT NULL,
    PRIMARY KEY (memory_id, ref_type)
);

CREATE INDEX IF NOT EXISTS idx_refs_memory ON reference_counts(memory_id);
CREATE INDEX IF NOT EXISTS idx_refs_type ON reference_counts(ref_type);

-- Append-only lifecycle event log
CREATE TABLE IF NOT EXISTS memory_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_type ON memory_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_created ON memory_events(created_at);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
