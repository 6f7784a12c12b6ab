#![allow(dead_code)]

use mnemos::config::{MnemosConfig, PoolConfig, QueueConfig};
use mnemos::db::{self, ConnectionPool};
use mnemos::runtime::Runtime;
use std::sync::Arc;
use tempfile::TempDir;

/// Open a pool on a fresh database in a temp directory.
/// Keep the `TempDir` alive for as long as the pool is used.
pub fn test_pool() -> (TempDir, Arc<ConnectionPool>) {
    test_pool_with(PoolConfig::default())
}

pub fn test_pool_with(config: PoolConfig) -> (TempDir, Arc<ConnectionPool>) {
    let tmp = TempDir::new().unwrap();
    let pool = db::open_pool(tmp.path().join("memory.db"), config).unwrap();
    (tmp, pool)
}

/// Config pointing at a database inside `tmp`.
pub fn test_config(tmp: &TempDir) -> MnemosConfig {
    let mut config = MnemosConfig::default();
    config.storage.db_path = tmp.path().join("memory.db").to_string_lossy().into_owned();
    config
}

pub fn test_runtime() -> (TempDir, Runtime) {
    let tmp = TempDir::new().unwrap();
    let runtime = Runtime::open(test_config(&tmp)).unwrap();
    (tmp, runtime)
}

pub fn queue_config() -> QueueConfig {
    QueueConfig::default()
}

/// Overwrite a column on a queue row, for moving timestamps into the past.
pub fn set_queue_column(pool: &ConnectionPool, session_id: &str, column: &str, value: &str) {
    let conn = pool.get_connection().unwrap();
    conn.execute(
        &format!("UPDATE consolidation_queue SET {column} = ?1 WHERE session_id = ?2"),
        rusqlite::params![value, session_id],
    )
    .unwrap();
}
