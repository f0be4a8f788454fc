//! Leased pool for the network engine
//!
//! Up to `max_size` physical connections, each leased to at most one task at a
//! time. The first acquire of a task takes a slot; nested acquires under the same
//! [`TaskContext`] get the same connection back without taking another one.
//! Connections are probed on their way back and replaced when dead.

use super::usage::UsageTracker;
use super::{
    AbandonedLease, ConnectionPool, Lease, LeaseGuard, LeaseLedger, PoolState, PoolStats,
    StateCell, UsageRatios,
};
use crate::core::config::LeasedPoolConfig;
use crate::core::connection::{Access, ConnectionFactory, ConnectionHandle, TaskContext, TaskId};
use crate::core::dialect::Dialect;
use crate::core::error::{BusyReason, DatabaseError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

struct Affinity {
    handle: ConnectionHandle,
    depth: usize,
}

#[derive(Default)]
struct Book {
    idle: Vec<ConnectionHandle>,
    affinity: HashMap<TaskId, Affinity>,
}

#[derive(Default)]
struct Ledger {
    book: Mutex<Book>,
    usage: UsageTracker,
}

impl Ledger {
    /// Drop one nesting level of `task`
    fn leave(&self, task: TaskId) {
        if let Some(affinity) = self.book.lock().affinity.get_mut(&task) {
            affinity.depth = affinity.depth.saturating_sub(1).max(1);
        }
    }
}

impl LeaseLedger for Ledger {
    fn abandon(&self, lease: AbandonedLease) {
        if lease.nested {
            self.leave(lease.task);
            return;
        }
        self.book.lock().affinity.remove(&lease.task);
        if let Some(key) = lease.usage {
            self.usage.end(key);
        }
        // State of an abandoned connection is unknown; it is dropped along with
        // its slot and replaced on demand
        tracing::warn!(connection = lease.handle.id(), "discarding connection of abandoned lease");
    }
}

/// Bounded pool of physical connections with per-task affinity
pub struct LeasedPool {
    factory: Arc<dyn ConnectionFactory>,
    config: LeasedPoolConfig,
    slots: Arc<Semaphore>,
    ledger: Arc<Ledger>,
    state: StateCell,
    established: AtomicU64,
}

impl LeasedPool {
    /// Pool opening connections through `factory`, sized by `config`
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: LeasedPoolConfig) -> Self {
        let config = LeasedPoolConfig::new(config.max_size).with_min_idle(config.min_idle);
        Self {
            factory,
            slots: Arc::new(Semaphore::new(config.max_size)),
            config,
            ledger: Arc::new(Ledger::default()),
            state: StateCell::new(),
            established: AtomicU64::new(0),
        }
    }

    /// Sizing in effect
    pub fn config(&self) -> LeasedPoolConfig {
        self.config
    }

    async fn open(&self) -> Result<ConnectionHandle> {
        let connection = self.factory.connect().await?;
        let id = self.established.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(connection = id, target_db = %self.factory.describe(), "connection established");
        Ok(ConnectionHandle::new(id, connection))
    }

    async fn discard(&self, handle: &ConnectionHandle) {
        if let Err(e) = handle.close().await {
            tracing::debug!(connection = handle.id(), error = %e, "close of discarded connection failed");
        }
    }

    /// Put a connection back, probing it first and replacing it when dead
    async fn recycle(&self, handle: ConnectionHandle) {
        if self.state.load() != PoolState::Open {
            self.discard(&handle).await;
            return;
        }
        if handle.is_alive().await {
            self.ledger.book.lock().idle.push(handle);
            return;
        }

        tracing::warn!(connection = handle.id(), "connection failed liveness probe, replacing");
        self.discard(&handle).await;
        match self.open().await {
            Ok(fresh) => self.ledger.book.lock().idle.push(fresh),
            Err(e) => {
                tracing::warn!(error = %e, "could not replace dead connection; will retry on demand")
            }
        }
    }

    async fn close_idle(&self) {
        let idle = std::mem::take(&mut self.ledger.book.lock().idle);
        for handle in &idle {
            self.discard(handle).await;
        }
    }
}

#[async_trait]
impl ConnectionPool for LeasedPool {
    fn dialect(&self) -> Dialect {
        self.factory.dialect()
    }

    async fn initialize(&self) -> Result<()> {
        match self.state.load() {
            PoolState::Open => return Ok(()),
            PoolState::Draining | PoolState::Closed => {
                return Err(DatabaseError::state("pool is closed"))
            }
            PoolState::Created => {}
        }

        let mut opened = Vec::with_capacity(self.config.min_idle);
        for _ in 0..self.config.min_idle {
            match self.open().await {
                Ok(handle) => opened.push(handle),
                Err(e) => {
                    for handle in &opened {
                        self.discard(handle).await;
                    }
                    return Err(e);
                }
            }
        }
        self.ledger.book.lock().idle.extend(opened);

        if !self.state.transition(PoolState::Created, PoolState::Open) {
            self.close_idle().await;
            return Err(DatabaseError::state("pool initialized concurrently"));
        }
        tracing::info!(
            target_db = %self.factory.describe(),
            max_size = self.config.max_size,
            min_idle = self.config.min_idle,
            "leased pool open"
        );
        Ok(())
    }

    async fn acquire(
        &self,
        ctx: &TaskContext,
        access: Access,
        timeout: Duration,
    ) -> Result<Lease> {
        self.state.admit()?;
        let task = ctx.id();
        let ledger: Arc<dyn LeaseLedger> = self.ledger.clone();

        {
            let mut book = self.ledger.book.lock();
            if let Some(affinity) = book.affinity.get_mut(&task) {
                affinity.depth += 1;
                tracing::debug!(%task, depth = affinity.depth, "nested lease");
                let handle = affinity.handle.clone();
                return Ok(Lease::new(handle, task, access, LeaseGuard::Nested, None, ledger));
            }
        }

        // One deadline covers both the slot wait and opening a fresh connection
        let deadline = tokio::time::Instant::now() + timeout;
        let permit = match tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::busy(BusyReason::Draining)),
            Err(_) => {
                tracing::debug!(%task, waited_ms = timeout.as_millis() as u64, "acquire timed out");
                return Err(DatabaseError::busy_timeout(timeout));
            }
        };

        let idle = self.ledger.book.lock().idle.pop();
        let handle = match idle {
            Some(handle) => handle,
            None => match tokio::time::timeout_at(deadline, self.open()).await {
                Ok(opened) => opened?,
                Err(_) => {
                    tracing::debug!(%task, waited_ms = timeout.as_millis() as u64, "connect timed out");
                    return Err(DatabaseError::busy_timeout(timeout));
                }
            },
        };

        // Admission and affinity are decided under the same lock close() drains under
        let admitted = {
            let mut book = self.ledger.book.lock();
            let admitted = self.state.admit();
            if admitted.is_ok() {
                book.affinity.insert(
                    task,
                    Affinity {
                        handle: handle.clone(),
                        depth: 1,
                    },
                );
            }
            admitted
        };
        if let Err(e) = admitted {
            self.discard(&handle).await;
            return Err(e);
        }

        let usage = self.ledger.usage.begin();
        tracing::debug!(%task, ?access, connection = handle.id(), "lease acquired");
        Ok(Lease::new(
            handle,
            task,
            access,
            LeaseGuard::Slot(permit),
            Some(usage),
            ledger,
        ))
    }

    async fn release(&self, mut lease: Lease) -> Result<()> {
        let usage = lease.disarm();
        let task = lease.task();

        if lease.is_nested() {
            self.ledger.leave(task);
            return Ok(());
        }
        let affinity = self.ledger.book.lock().affinity.remove(&task);
        let handle = affinity
            .map(|a| a.handle)
            .unwrap_or_else(|| lease.connection().clone());
        if let Some(key) = usage {
            self.ledger.usage.end(key);
        }

        let mut result = Ok(());
        let mut reusable = true;
        if handle.in_transaction() {
            tracing::error!(
                %task,
                connection = handle.id(),
                "lease released with a transaction still open; rolling back"
            );
            if let Err(e) = handle.rollback().await {
                tracing::error!(connection = handle.id(), error = %e, "rollback failed");
                reusable = false;
            }
            result = Err(DatabaseError::state(format!(
                "{} released a lease while its transaction was still open",
                task
            )));
        }

        if reusable {
            self.recycle(handle.clone()).await;
        } else {
            self.discard(&handle).await;
        }
        // Slot goes back only after the connection is available again
        drop(lease);
        tracing::debug!(%task, connection = handle.id(), "lease released");

        let finished = {
            let book = self.ledger.book.lock();
            book.affinity.is_empty() && self.state.transition(PoolState::Draining, PoolState::Closed)
        };
        if finished {
            tracing::info!(target_db = %self.factory.describe(), "leased pool closed");
        }
        result
    }

    fn usage_ratios(&self) -> UsageRatios {
        UsageRatios::from_tracker(&self.ledger.usage)
    }

    fn stats(&self) -> PoolStats {
        let book = self.ledger.book.lock();
        PoolStats {
            active: book.affinity.len(),
            idle: book.idle.len(),
            total_established: self.established.load(Ordering::Acquire),
            max_size: self.config.max_size,
        }
    }

    fn state(&self) -> PoolState {
        self.state.load()
    }

    async fn close(&self) -> Result<()> {
        let finished = {
            let book = self.ledger.book.lock();
            match self.state.load() {
                PoolState::Closed | PoolState::Draining => return Ok(()),
                PoolState::Created => {
                    self.state.store(PoolState::Closed);
                    return Ok(());
                }
                PoolState::Open => self.state.store(PoolState::Draining),
            }
            book.affinity.is_empty()
        };
        tracing::info!(target_db = %self.factory.describe(), "leased pool draining");
        self.slots.close();
        self.close_idle().await;

        if finished && self.state.transition(PoolState::Draining, PoolState::Closed) {
            tracing::info!(target_db = %self.factory.describe(), "leased pool closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testing::FakeFactory;

    const WAIT: Duration = Duration::from_millis(50);

    async fn pool(max_size: usize) -> (Arc<FakeFactory>, LeasedPool) {
        let factory = Arc::new(FakeFactory::default());
        let pool = LeasedPool::new(factory.clone(), LeasedPoolConfig::new(max_size));
        pool.initialize().await.unwrap();
        (factory, pool)
    }

    #[tokio::test]
    async fn test_initialize_opens_min_idle() {
        let (factory, pool) = pool(4).await;
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.max_size, 4);
    }

    #[tokio::test]
    async fn test_affinity_and_distinct_tasks() {
        let (_factory, pool) = pool(2).await;
        let a = TaskContext::new();
        let b = TaskContext::new();

        let outer = pool.acquire(&a, Access::Write, WAIT).await.unwrap();
        let nested = pool.acquire(&a, Access::Read, WAIT).await.unwrap();
        assert!(nested.is_nested());
        assert!(nested.connection().same_connection(outer.connection()));

        let other = pool.acquire(&b, Access::Read, WAIT).await.unwrap();
        assert!(!other.connection().same_connection(outer.connection()));
        assert_eq!(pool.stats().active, 2);

        pool.release(nested).await.unwrap();
        pool.release(outer).await.unwrap();
        pool.release(other).await.unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_is_busy() {
        let (_factory, pool) = pool(1).await;
        let holder = pool.acquire(&TaskContext::new(), Access::Write, WAIT).await.unwrap();

        let err = pool
            .acquire(&TaskContext::new(), Access::Read, WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Timeout { .. } }));
        assert_eq!(pool.stats().active, 1);

        pool.release(holder).await.unwrap();
        let next = pool.acquire(&TaskContext::new(), Access::Read, WAIT).await.unwrap();
        pool.release(next).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced() {
        let (factory, pool) = pool(1).await;
        let ctx = TaskContext::new();
        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        let dead_id = lease.connection().id();
        factory.switches.lock()[0].store(false, Ordering::SeqCst);

        pool.release(lease).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);

        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        assert_ne!(lease.connection().id(), dead_id);
        assert_eq!(pool.stats().total_established, 2);
        pool.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_mid_transaction_rolls_back() {
        let (factory, pool) = pool(1).await;
        let lease = pool.acquire(&TaskContext::new(), Access::Write, WAIT).await.unwrap();
        lease.connection().begin().await.unwrap();

        let err = pool.release(lease).await.unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
        assert_eq!(factory.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_slot() {
        let (_factory, pool) = pool(1).await;
        let ctx = TaskContext::new();
        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        drop(lease);
        assert_eq!(pool.stats().active, 0);

        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        assert!(!lease.is_nested());
        pool.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_waiters_and_new_callers() {
        let (factory, pool) = pool(1).await;
        let pool = Arc::new(pool);
        let holder = pool.acquire(&TaskContext::new(), Access::Write, WAIT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(&TaskContext::new(), Access::Write, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Draining }));
        assert_eq!(pool.state(), PoolState::Draining);

        pool.release(holder).await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(factory.switches.lock().iter().all(|alive| !alive.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_slow_connect_is_bounded_by_timeout() {
        let factory = Arc::new(FakeFactory::default());
        let pool = LeasedPool::new(factory.clone(), LeasedPoolConfig::new(2).with_min_idle(1));
        pool.initialize().await.unwrap();
        let holder = pool.acquire(&TaskContext::new(), Access::Write, WAIT).await.unwrap();

        *factory.connect_delay.lock() = Duration::from_secs(2);
        let started = std::time::Instant::now();
        let err = pool
            .acquire(&TaskContext::new(), Access::Read, WAIT)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Timeout { .. } }));
        assert_eq!(pool.stats().active, 1);

        // The slot taken for the abandoned connect went back
        *factory.connect_delay.lock() = Duration::ZERO;
        let next = pool.acquire(&TaskContext::new(), Access::Read, WAIT).await.unwrap();
        assert_eq!(pool.stats().active, 2);
        pool.release(next).await.unwrap();
        pool.release(holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_with_no_holders_closes_at_once() {
        let (_factory, pool) = pool(2).await;
        let lease = pool.acquire(&TaskContext::new(), Access::Read, WAIT).await.unwrap();
        pool.release(lease).await.unwrap();

        pool.close().await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        let err = pool
            .acquire(&TaskContext::new(), Access::Read, WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Draining }));
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_initialize_failure_propagates() {
        let factory = Arc::new(FakeFactory::default());
        factory.refuse.store(true, Ordering::SeqCst);
        let pool = LeasedPool::new(factory, LeasedPoolConfig::new(2));
        let err = pool.initialize().await.unwrap_err();
        assert!(matches!(err, DatabaseError::ConnectionFailed { .. }));
        assert_eq!(pool.state(), PoolState::Created);
    }
}
