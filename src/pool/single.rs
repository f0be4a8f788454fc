//! Single-connection pool for the embedded engine
//!
//! One physical connection guarded by a fair reader/writer lock: read leases
//! share it, a write lease is exclusive. The lock is reentrant per task, so
//! nested calls made under the same [`TaskContext`] reuse the outer lease.

use super::usage::UsageTracker;
use super::{
    rollback_detached, AbandonedLease, ConnectionPool, Lease, LeaseGuard, LeaseLedger,
    PoolState, PoolStats, StateCell, UsageRatios,
};
use crate::core::connection::{Access, ConnectionFactory, ConnectionHandle, TaskContext, TaskId};
use crate::core::dialect::Dialect;
use crate::core::error::{DatabaseError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Holder {
    depth: usize,
    access: Access,
}

#[derive(Default)]
struct Ledger {
    holders: Mutex<HashMap<TaskId, Holder>>,
    usage: UsageTracker,
}

impl Ledger {
    /// Drop one nesting level of `task`
    fn leave(&self, task: TaskId) {
        if let Some(holder) = self.holders.lock().get_mut(&task) {
            holder.depth = holder.depth.saturating_sub(1).max(1);
        }
    }
}

impl LeaseLedger for Ledger {
    fn abandon(&self, lease: AbandonedLease) {
        if lease.nested {
            self.leave(lease.task);
            return;
        }
        self.holders.lock().remove(&lease.task);
        if let Some(key) = lease.usage {
            self.usage.end(key);
        }
        if matches!(lease.guard, LeaseGuard::Write(_)) && lease.handle.in_transaction() {
            rollback_detached(lease.handle, lease.guard);
        }
    }
}

/// Pool around exactly one physical connection
pub struct SingleConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    connection: RwLock<Option<ConnectionHandle>>,
    lock: Arc<tokio::sync::RwLock<()>>,
    ledger: Arc<Ledger>,
    state: StateCell,
    established: AtomicU64,
}

impl SingleConnectionPool {
    /// Pool that opens its connection through `factory` on [`ConnectionPool::initialize`]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            connection: RwLock::new(None),
            lock: Arc::new(tokio::sync::RwLock::new(())),
            ledger: Arc::new(Ledger::default()),
            state: StateCell::new(),
            established: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Result<ConnectionHandle> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| DatabaseError::state("pool has no open connection"))
    }

    async fn close_connection(&self) {
        let handle = self.connection.write().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                tracing::warn!(connection = handle.id(), error = %e, "failed to close connection");
            }
        }
        self.state.store(PoolState::Closed);
        tracing::info!(target_db = %self.factory.describe(), "single-connection pool closed");
    }
}

#[async_trait]
impl ConnectionPool for SingleConnectionPool {
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

        let connection = self.factory.connect().await?;
        let id = self.established.fetch_add(1, Ordering::AcqRel) + 1;
        *self.connection.write() = Some(ConnectionHandle::new(id, connection));

        if !self.state.transition(PoolState::Created, PoolState::Open) {
            return Err(DatabaseError::state("pool initialized concurrently"));
        }
        tracing::info!(target_db = %self.factory.describe(), "single-connection pool open");
        Ok(())
    }

    async fn acquire(
        &self,
        ctx: &TaskContext,
        access: Access,
        timeout: Duration,
    ) -> Result<Lease> {
        self.state.admit()?;
        let handle = self.current()?;
        let task = ctx.id();
        let ledger: Arc<dyn LeaseLedger> = self.ledger.clone();

        {
            let mut holders = self.ledger.holders.lock();
            if let Some(holder) = holders.get_mut(&task) {
                if holder.access == Access::Read && access == Access::Write {
                    return Err(DatabaseError::usage(format!(
                        "{} holds a read lease and cannot upgrade it to write",
                        task
                    )));
                }
                holder.depth += 1;
                tracing::debug!(%task, depth = holder.depth, "nested lease");
                return Ok(Lease::new(handle, task, access, LeaseGuard::Nested, None, ledger));
            }
        }

        let guard = match access {
            Access::Read => tokio::time::timeout(timeout, self.lock.clone().read_owned())
                .await
                .map(LeaseGuard::Read),
            Access::Write => tokio::time::timeout(timeout, self.lock.clone().write_owned())
                .await
                .map(LeaseGuard::Write),
        }
        .map_err(|_| {
            tracing::debug!(%task, ?access, waited_ms = timeout.as_millis() as u64, "acquire timed out");
            DatabaseError::busy_timeout(timeout)
        })?;

        // The pool may have started draining while we waited; admission and the
        // holder entry share the lock close() checks emptiness under
        {
            let mut holders = self.ledger.holders.lock();
            self.state.admit()?;
            holders.insert(task, Holder { depth: 1, access });
        }

        let usage = self.ledger.usage.begin();
        tracing::debug!(%task, ?access, connection = handle.id(), "lease acquired");
        Ok(Lease::new(handle, task, access, guard, Some(usage), ledger))
    }

    async fn release(&self, mut lease: Lease) -> Result<()> {
        let usage = lease.disarm();
        let task = lease.task();

        if lease.is_nested() {
            self.ledger.leave(task);
            return Ok(());
        }

        let handle = lease.connection().clone();
        let mut result = Ok(());
        if lease.access() == Access::Write && handle.in_transaction() {
            tracing::error!(
                %task,
                connection = handle.id(),
                "write lease released with a transaction still open; rolling back"
            );
            if let Err(e) = handle.rollback().await {
                tracing::error!(connection = handle.id(), error = %e, "rollback failed");
            }
            result = Err(DatabaseError::state(format!(
                "{} released a write lease while its transaction was still open",
                task
            )));
        }

        if let Some(key) = usage {
            self.ledger.usage.end(key);
        }
        let drained = {
            let mut holders = self.ledger.holders.lock();
            holders.remove(&task);
            holders.is_empty() && self.state.load() == PoolState::Draining
        };
        drop(lease);
        tracing::debug!(%task, connection = handle.id(), "lease released");

        if drained {
            self.close_connection().await;
        }
        result
    }

    fn usage_ratios(&self) -> UsageRatios {
        UsageRatios::from_tracker(&self.ledger.usage)
    }

    fn stats(&self) -> PoolStats {
        let active = self.ledger.holders.lock().len();
        let open = usize::from(self.connection.read().is_some());
        PoolStats {
            active,
            idle: if active == 0 { open } else { 0 },
            total_established: self.established.load(Ordering::Acquire),
            max_size: 1,
        }
    }

    fn state(&self) -> PoolState {
        self.state.load()
    }

    async fn close(&self) -> Result<()> {
        let idle = {
            let holders = self.ledger.holders.lock();
            match self.state.load() {
                PoolState::Closed | PoolState::Draining => return Ok(()),
                PoolState::Created => {
                    self.state.store(PoolState::Closed);
                    return Ok(());
                }
                PoolState::Open => self.state.store(PoolState::Draining),
            }
            holders.is_empty()
        };
        tracing::info!(target_db = %self.factory.describe(), "single-connection pool draining");
        if idle {
            self.close_connection().await;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backends::sqlite::SqliteConnectionFactory;
    use crate::core::config::SqliteConfig;
    use crate::core::error::BusyReason;

    async fn pool() -> (tempfile::TempDir, SingleConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteConnectionFactory::new(SqliteConfig::new(dir.path().join("p.db")));
        let pool = SingleConnectionPool::new(Arc::new(factory));
        pool.initialize().await.unwrap();
        (dir, pool)
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_acquire_before_initialize_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SqliteConnectionFactory::new(SqliteConfig::new(dir.path().join("p.db")));
        let pool = SingleConnectionPool::new(Arc::new(factory));
        let err = pool
            .acquire(&TaskContext::new(), Access::Read, WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::NotInitialized }));
    }

    #[tokio::test]
    async fn test_readers_share_writer_excludes() {
        let (_dir, pool) = pool().await;
        let a = TaskContext::new();
        let b = TaskContext::new();
        let c = TaskContext::new();

        let ra = pool.acquire(&a, Access::Read, WAIT).await.unwrap();
        let rb = pool.acquire(&b, Access::Read, WAIT).await.unwrap();
        assert_eq!(pool.stats().active, 2);

        let err = pool.acquire(&c, Access::Write, WAIT).await.unwrap_err();
        assert!(err.is_busy());

        pool.release(ra).await.unwrap();
        pool.release(rb).await.unwrap();

        let w = pool.acquire(&c, Access::Write, WAIT).await.unwrap();
        let err = pool.acquire(&a, Access::Read, WAIT).await.unwrap_err();
        assert!(err.is_busy());
        pool.release(w).await.unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_reentrant_for_same_task() {
        let (_dir, pool) = pool().await;
        let ctx = TaskContext::new();

        let outer = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        let inner = pool.acquire(&ctx, Access::Read, WAIT).await.unwrap();
        assert!(inner.is_nested());
        assert!(inner.connection().same_connection(outer.connection()));
        pool.release(inner).await.unwrap();
        pool.release(outer).await.unwrap();

        let read = pool.acquire(&ctx, Access::Read, WAIT).await.unwrap();
        let err = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Usage(_)));
        pool.release(read).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_mid_transaction_is_loud() {
        let (_dir, pool) = pool().await;
        let ctx = TaskContext::new();
        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        lease.connection().begin().await.unwrap();

        let handle = lease.connection().clone();
        let err = pool.release(lease).await.unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
        assert!(!handle.in_transaction());

        // The lock was still freed
        let again = pool.acquire(&TaskContext::new(), Access::Write, WAIT).await.unwrap();
        pool.release(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_bookkeeping() {
        let (_dir, pool) = pool().await;
        let ctx = TaskContext::new();
        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        drop(lease);
        assert_eq!(pool.stats().active, 0);

        let lease = pool.acquire(&ctx, Access::Write, WAIT).await.unwrap();
        assert!(!lease.is_nested());
        pool.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains() {
        let (_dir, pool) = pool().await;
        let ctx = TaskContext::new();
        let lease = pool.acquire(&ctx, Access::Read, WAIT).await.unwrap();

        pool.close().await.unwrap();
        assert_eq!(pool.state(), PoolState::Draining);
        let err = pool
            .acquire(&TaskContext::new(), Access::Read, WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Draining }));

        pool.release(lease).await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(pool.stats().total_established, 1);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_close_is_refused() {
        let (_dir, pool) = pool().await;
        let pool = Arc::new(pool);
        let reader = pool.acquire(&TaskContext::new(), Access::Read, WAIT).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(&TaskContext::new(), Access::Write, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await.unwrap();
        pool.release(reader).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DatabaseError::Busy { reason: BusyReason::Draining }));
        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(pool.stats().active, 0);
    }
}
