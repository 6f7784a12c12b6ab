//! Per-memory reference counts that protect memories from archival and GC.
//!
//! A memory is referenced when a relationship edge, derived chunk, recorded
//! decision, or synthesis input points at it. Counts live in `reference_counts`,
//! one row per `(memory_id, ref_type)`, and never go below zero.
//!
//! Memories that were never referenced have no rows and are invisible here;
//! callers looking for GC candidates must cross-check their own inventory.

use anyhow::Result;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::db::{self, ConnectionPool};

/// Kinds of reference a memory can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    /// Cited by an edge in the relationship graph.
    Relationship,
    /// Source of a derived chunk.
    Chunk,
    /// Cited by a recorded decision.
    Decision,
    /// Input to a synthesized memory.
    Synthesis,
}

impl RefType {
    pub const ALL: [RefType; 4] = [
        Self::Relationship,
        Self::Chunk,
        Self::Decision,
        Self::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relationship => "relationship",
            Self::Chunk => "chunk",
            Self::Decision => "decision",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for RefType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RefType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relationship" => Ok(Self::Relationship),
            "chunk" => Ok(Self::Chunk),
            "decision" => Ok(Self::Decision),
            "synthesis" => Ok(Self::Synthesis),
            _ => Err(format!("unknown reference type: {s}")),
        }
    }
}

/// Reference counts for one memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefCounts {
    pub relationship: u64,
    pub chunk: u64,
    pub decision: u64,
    pub synthesis: u64,
    pub total: u64,
}

impl RefCounts {
    pub fn get(&self, ref_type: RefType) -> u64 {
        match ref_type {
            RefType::Relationship => self.relationship,
            RefType::Chunk => self.chunk,
            RefType::Decision => self.decision,
            RefType::Synthesis => self.synthesis,
        }
    }

    fn set(&mut self, ref_type: RefType, count: u64) {
        match ref_type {
            RefType::Relationship => self.relationship = count,
            RefType::Chunk => self.chunk = count,
            RefType::Decision => self.decision = count,
            RefType::Synthesis => self.synthesis = count,
        }
        self.total = RefType::ALL.iter().map(|t| self.get(*t)).sum();
    }
}

/// A positive reference to a memory outside the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub memory_id: String,
    pub ref_type: RefType,
    pub ref_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ReferenceSummary {
    pub tracked_memories: u64,
    pub protected: u64,
    pub unreferenced: u64,
    pub by_type: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct ReferenceCounter {
    pool: Arc<ConnectionPool>,
}

impl ReferenceCounter {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Add one reference of `ref_type` to `memory_id`. Returns the new count.
    pub fn increment(&self, memory_id: &str, ref_type: RefType) -> Result<u64> {
        let conn = self.pool.get_connection()?;
        Self::increment_in(&conn, memory_id, ref_type)
    }

    /// [`increment`](Self::increment) on the caller's connection, so the count
    /// commits or rolls back with the caller's transaction.
    pub fn increment_in(conn: &Connection, memory_id: &str, ref_type: RefType) -> Result<u64> {
        let count: i64 = conn.query_row(
            "INSERT INTO reference_counts (memory_id, ref_type, ref_count, last_updated) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(memory_id, ref_type) DO UPDATE SET \
               ref_count = ref_count + 1, last_updated = excluded.last_updated \
             RETURNING ref_count",
            params![memory_id, ref_type.as_str(), db::now_timestamp()],
            |row| row.get(0),
        )?;
        tracing::trace!(memory_id, ref_type = %ref_type, count, "reference added");
        Ok(count as u64)
    }

    /// Remove one reference, flooring at zero. An unseen pair gets a zero row.
    pub fn decrement(&self, memory_id: &str, ref_type: RefType) -> Result<u64> {
        let conn = self.pool.get_connection()?;
        let count: i64 = conn.query_row(
            "INSERT INTO reference_counts (memory_id, ref_type, ref_count, last_updated) \
             VALUES (?1, ?2, 0, ?3) \
             ON CONFLICT(memory_id, ref_type) DO UPDATE SET \
               ref_count = MAX(ref_count - 1, 0), last_updated = excluded.last_updated \
             RETURNING ref_count",
            params![memory_id, ref_type.as_str(), db::now_timestamp()],
            |row| row.get(0),
        )?;
        tracing::trace!(memory_id, ref_type = %ref_type, count, "reference removed");
        Ok(count as u64)
    }

    /// Counts per reference type plus the total.
    pub fn get_count(&self, memory_id: &str) -> Result<RefCounts> {
        let conn = self.pool.get_connection()?;
        let rows: Vec<(String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT ref_type, ref_count FROM reference_counts WHERE memory_id = ?1",
            )?;
            let collected = stmt
                .query_map(params![memory_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut counts = RefCounts::default();
        for (kind, count) in rows {
            match kind.parse::<RefType>() {
                Ok(ref_type) => counts.set(ref_type, count.max(0) as u64),
                Err(e) => tracing::warn!(memory_id, error = %e, "ignoring reference row"),
            }
        }
        Ok(counts)
    }

    /// Whether any reference still points at `memory_id`.
    pub fn is_protected(&self, memory_id: &str) -> Result<bool> {
        Ok(self.get_count(memory_id)?.total > 0)
    }

    /// Memories the counter has seen whose total count is zero.
    pub fn get_zero_ref_memories(&self) -> Result<Vec<String>> {
        let conn = self.pool.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT memory_id FROM reference_counts \
             GROUP BY memory_id HAVING SUM(ref_count) = 0 \
             ORDER BY memory_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Recompute `relationship` counts from a complete edge list.
    ///
    /// Every existing relationship count is zeroed first, then each edge adds one
    /// reference to both endpoints. Other reference types are left alone. Returns
    /// the number of memories that ended up with a positive relationship count.
    pub fn bulk_update_from_relationships(&self, edges: &[(String, String)]) -> Result<usize> {
        let mut derived: HashMap<&str, i64> = HashMap::new();
        for (source, target) in edges {
            *derived.entry(source.as_str()).or_default() += 1;
            *derived.entry(target.as_str()).or_default() += 1;
        }

        let mut conn = self.pool.get_connection()?;
        let now = db::now_timestamp();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE reference_counts SET ref_count = 0, last_updated = ?1 \
             WHERE ref_type = 'relationship'",
            params![now],
        )?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO reference_counts (memory_id, ref_type, ref_count, last_updated) \
                 VALUES (?1, 'relationship', ?2, ?3) \
                 ON CONFLICT(memory_id, ref_type) DO UPDATE SET \
                   ref_count = excluded.ref_count, last_updated = excluded.last_updated",
            )?;
            for (memory_id, count) in &derived {
                upsert.execute(params![memory_id, count, now])?;
            }
        }
        tx.commit()?;

        tracing::info!(
            edges = edges.len(),
            memories = derived.len(),
            "relationship reference counts rebuilt"
        );
        Ok(derived.len())
    }

    /// Positive references to memories outside `active_memory_ids`.
    pub fn find_dangling_references(
        &self,
        active_memory_ids: &HashSet<String>,
    ) -> Result<Vec<DanglingReference>> {
        let conn = self.pool.get_connection()?;
        let rows = positive_references(&conn)?;

        let dangling: Vec<DanglingReference> = rows
            .into_iter()
            .filter(|r| !active_memory_ids.contains(&r.memory_id))
            .collect();
        if !dangling.is_empty() {
            tracing::warn!(count = dangling.len(), "dangling memory references found");
        }
        Ok(dangling)
    }

    /// Aggregate view used by `mnemos refs stats`.
    pub fn summary(&self) -> Result<ReferenceSummary> {
        let conn = self.pool.get_connection()?;

        let (tracked, protected): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(total > 0), 0) FROM \
             (SELECT memory_id, SUM(ref_count) AS total FROM reference_counts GROUP BY memory_id)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut by_type: BTreeMap<String, u64> = RefType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        let rows: Vec<(String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT ref_type, SUM(ref_count) FROM reference_counts GROUP BY ref_type",
            )?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };
        for (kind, total) in rows {
            by_type.insert(kind, total as u64);
        }

        Ok(ReferenceSummary {
            tracked_memories: tracked as u64,
            protected: protected as u64,
            unreferenced: (tracked - protected) as u64,
            by_type,
        })
    }
}

fn positive_references(conn: &Connection) -> Result<Vec<DanglingReference>> {
    let mut stmt = conn.prepare(
        "SELECT memory_id, ref_type, ref_count FROM reference_counts \
         WHERE ref_count > 0 ORDER BY memory_id, ref_type",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(memory_id, kind, count)| {
            kind.parse().ok().map(|ref_type| DanglingReference {
                memory_id,
                ref_type,
                ref_count: count as u64,
            })
        })
        .collect())
}
