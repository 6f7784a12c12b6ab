//! Composition root: opens the database once and hands out the components that share it.

use anyhow::Result;
use std::sync::Arc;

use crate::breaker::{BreakerPolicy, BreakerRegistry, CircuitBreaker};
use crate::config::MnemosConfig;
use crate::db::{ConnectionPool, PoolRegistry};
use crate::events::EventBus;
use crate::memory::references::ReferenceCounter;
use crate::queue::consolidator::Consolidator;
use crate::queue::worker::{Worker, WorkerSettings};
use crate::queue::ConsolidationQueue;

pub struct Runtime {
    config: MnemosConfig,
    pools: PoolRegistry,
    pool: Arc<ConnectionPool>,
    breakers: BreakerRegistry,
    events: Arc<EventBus>,
}

impl Runtime {
    /// Open (or create) the configured database and wire up the shared components.
    pub fn open(config: MnemosConfig) -> Result<Self> {
        let pools = PoolRegistry::new();
        let pool = pools.get_or_open(&config.resolved_db_path(), &config.pool)?;
        let breakers = BreakerRegistry::new(Arc::clone(&pool));
        let events = Arc::new(EventBus::new(Arc::clone(&pool)));

        tracing::debug!(db = %pool.path().display(), "runtime opened");
        Ok(Self {
            config,
            pools,
            pool,
            breakers,
            events,
        })
    }

    pub fn config(&self) -> &MnemosConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> ConsolidationQueue {
        ConsolidationQueue::new(Arc::clone(&self.pool), self.config.queue.clone())
    }

    pub fn references(&self) -> ReferenceCounter {
        ReferenceCounter::new(Arc::clone(&self.pool))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Breaker guarding the reasoning backend named in `[breaker] backend`.
    pub fn backend_breaker(&self) -> Result<Arc<CircuitBreaker>> {
        self.breakers.get_or_create(
            &self.config.breaker.backend,
            BreakerPolicy::from(&self.config.breaker),
        )
    }

    /// Build a worker; rejects settings whose stale sweep could reclaim a live session.
    pub fn worker(&self, consolidator: Arc<dyn Consolidator>, settings: WorkerSettings) -> Result<Worker> {
        Worker::new(
            self.queue(),
            self.backend_breaker()?,
            Arc::clone(&self.events),
            consolidator,
            settings,
        )
    }

    /// Close every pooled connection. Outstanding guards close theirs on drop.
    pub fn shutdown(&self) {
        self.pools.close_all();
        tracing::debug!("runtime shut down");
    }
}
