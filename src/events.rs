//! Durable publish/subscribe log of memory lifecycle events.
//!
//! [`EventBus::publish`] appends a row to `memory_events`, then delivers the event
//! synchronously to subscribers of that type and then to wildcard subscribers, each
//! in registration order. A failing or panicking subscriber is logged and skipped;
//! it never blocks other subscribers or fails the publish.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::db::{self, ConnectionPool};

/// The fixed set of event kinds the bus accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MemoryCreated,
    MemoryUpdated,
    MemoryArchived,
    MemoryDeleted,
    MemoryReinforced,
    SessionQueued,
    ConsolidationFailed,
    SessionAbandoned,
    ReferencesRebuilt,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        Self::MemoryCreated,
        Self::MemoryUpdated,
        Self::MemoryArchived,
        Self::MemoryDeleted,
        Self::MemoryReinforced,
        Self::SessionQueued,
        Self::ConsolidationFailed,
        Self::SessionAbandoned,
        Self::ReferencesRebuilt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryCreated => "memory_created",
            Self::MemoryUpdated => "memory_updated",
            Self::MemoryArchived => "memory_archived",
            Self::MemoryDeleted => "memory_deleted",
            Self::MemoryReinforced => "memory_reinforced",
            Self::SessionQueued => "session_queued",
            Self::ConsolidationFailed => "consolidation_failed",
            Self::SessionAbandoned => "session_abandoned",
            Self::ReferencesRebuilt => "references_rebuilt",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    /// Accepts both `memory_created` and `MEMORY_CREATED`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A persisted event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<String>,
}

pub type Subscriber = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    by_type: HashMap<EventType, Vec<Subscriber>>,
    wildcard: Vec<Subscriber>,
}

pub struct EventBus {
    pool: Arc<ConnectionPool>,
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            subscribers: Mutex::new(Subscribers::default()),
        }
    }

    /// Register a handler for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.lock_subscribers()
            .by_type
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every event type.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.lock_subscribers().wildcard.push(Arc::new(handler));
    }

    /// Persist an event and deliver it to subscribers.
    pub fn publish(&self, event_type: EventType, payload: serde_json::Value) -> Result<Event> {
        let created_at = db::now_timestamp();
        let id = {
            let conn = self.pool.get_connection()?;
            conn.execute(
                "INSERT INTO memory_events (event_type, payload_json, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![event_type.as_str(), payload.to_string(), created_at],
            )
            .with_context(|| format!("failed to record {event_type} event"))?;
            conn.last_insert_rowid()
        };

        let event = Event {
            id,
            event_type,
            payload,
            created_at,
        };
        tracing::debug!(event_id = id, event_type = %event_type, "event published");

        // Snapshot handlers so a handler may itself subscribe or publish.
        let handlers: Vec<Subscriber> = {
            let subscribers = self.lock_subscribers();
            subscribers
                .by_type
                .get(&event_type)
                .into_iter()
                .flatten()
                .chain(subscribers.wildcard.iter())
                .cloned()
                .collect()
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event_type = %event_type, error = %e, "event subscriber failed");
                }
                Err(_) => {
                    tracing::warn!(event_type = %event_type, "event subscriber panicked");
                }
            }
        }

        Ok(event)
    }

    /// Most recent events, newest first, optionally filtered by type.
    pub fn get_recent(&self, event_type: Option<EventType>, limit: usize) -> Result<Vec<Event>> {
        let conn = self.pool.get_connection()?;
        let limit = limit as i64;

        let rows: Vec<(i64, String, String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, payload_json, created_at FROM memory_events \
                 WHERE (?1 IS NULL OR event_type = ?1) \
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let collected = stmt
                .query_map(params![event_type.map(|t| t.as_str()), limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut events = Vec::with_capacity(rows.len());
        for (id, kind, payload_json, created_at) in rows {
            let event_type = match kind.parse::<EventType>() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(event_id = id, error = %e, "skipping stored event");
                    continue;
                }
            };
            let payload = serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null);
            events.push(Event {
                id,
                event_type,
                payload,
                created_at,
            });
        }
        Ok(events)
    }

    /// Event counts per type plus the time range covered by the log.
    pub fn get_stats(&self) -> Result<EventStats> {
        let conn = self.pool.get_connection()?;

        let mut by_type: HashMap<String, u64> = EventType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();

        let rows: Vec<(String, i64)> = {
            let mut stmt =
                conn.prepare("SELECT event_type, COUNT(*) FROM memory_events GROUP BY event_type")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };
        for (kind, count) in rows {
            by_type.insert(kind, count as u64);
        }

        let (total, oldest, newest): (i64, Option<String>, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM memory_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(EventStats {
            total: total as u64,
            by_type,
            oldest,
            newest,
        })
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
