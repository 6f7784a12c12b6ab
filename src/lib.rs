//! Mnemos: the concurrency and lifecycle layer beneath a persistent AI memory store.
//!
//! Several processes (hooks, a consolidation worker, a CLI) share one SQLite
//! database. This crate provides the pieces that keep that safe and resilient:
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`db::ConnectionPool`] | Bounded, reusable WAL connections with retry backoff |
//! | [`breaker::CircuitBreaker`] | Persisted closed/open/half-open guard around unreliable backends |
//! | [`events::EventBus`] | Durable event log with in-process subscribers |
//! | [`memory::references::ReferenceCounter`] | Per-memory reference counts that protect memories from archival |
//! | [`queue::ConsolidationQueue`] | Durable session work queue with exponential backoff |
//! | [`queue::worker::Worker`] | Batch worker that drains the queue through the breaker |
//!
//! # Modules
//!
//! - [`breaker`]: persisted circuit breakers and the registry that shares them by name
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: connection pool, schema, migrations and health checks
//! - [`events`]: event types, the durable event log and subscriber dispatch
//! - [`memory`]: per-memory reference counting
//! - [`queue`]: consolidation queue, consolidator contract and batch worker
//! - [`runtime`]: composition root that owns the pool and breaker registries

pub mod breaker;
pub mod config;
pub mod db;
pub mod events;
pub mod memory;
pub mod queue;
pub mod runtime;
