//! Connection pools
//!
//! [`ConnectionPool`] is the contract the connection manager is built on. Two
//! independent implementations exist:
//!
//! - [`SingleConnectionPool`]: one physical connection guarded by a fair
//!   reader/writer lock, for the embedded engine.
//! - [`LeasedPool`]: a bounded set of physical connections with per-task
//!   affinity, for the network engine.
//!
//! Both record lease spans in a shared [`UsageTracker`].

pub mod leased;
pub mod single;
pub mod usage;

pub use leased::LeasedPool;
pub use single::SingleConnectionPool;
pub use usage::{UsageKey, UsageTracker, STANDARD_WINDOWS};

use crate::core::connection::{Access, ConnectionHandle, TaskContext, TaskId};
use crate::core::dialect::Dialect;
use crate::core::error::{BusyReason, DatabaseError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit};

/// Pool contract
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Dialect of the pooled connections
    fn dialect(&self) -> Dialect;

    /// True for the network engine family
    fn is_mysql_like(&self) -> bool {
        self.dialect().is_mysql_like()
    }

    /// Open the initial connections; acquisitions before this fail with busy
    async fn initialize(&self) -> Result<()>;

    /// Lease a connection for `ctx`, waiting at most `timeout`
    ///
    /// A context that already holds a lease gets the same connection back as a
    /// nested lease without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Busy`] when the wait is exceeded, the pool is
    /// draining, or it has not been initialized.
    async fn acquire(&self, ctx: &TaskContext, access: Access, timeout: Duration)
        -> Result<Lease>;

    /// Give a lease back
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::State`] when the connection is still inside a
    /// transaction; the transaction is rolled back before the error is returned.
    async fn release(&self, lease: Lease) -> Result<()>;

    /// Utilization over the trailing 5 minutes, 1 minute and 5 seconds
    fn usage_ratios(&self) -> UsageRatios;

    /// Connection counts
    fn stats(&self) -> PoolStats;

    /// Lifecycle state
    fn state(&self) -> PoolState;

    /// Stop admitting leases and close connections once they come back
    async fn close(&self) -> Result<()>;
}

/// Share of wall-clock time with at least one lease open, summed over leases
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageRatios {
    pub five_minutes: f64,
    pub one_minute: f64,
    pub five_seconds: f64,
}

impl UsageRatios {
    pub(crate) fn from_tracker(tracker: &UsageTracker) -> Self {
        let ratios = tracker.ratios(&STANDARD_WINDOWS);
        Self {
            five_minutes: ratios[0],
            one_minute: ratios[1],
            five_seconds: ratios[2],
        }
    }

    /// Ratios as `[5m, 1m, 5s]`
    pub fn as_array(&self) -> [f64; 3] {
        [self.five_minutes, self.one_minute, self.five_seconds]
    }
}

/// Connection counts reported by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Tasks currently holding a lease
    pub active: usize,
    /// Open connections not leased to anyone
    pub idle: usize,
    /// Physical connections opened since the pool was created
    pub total_established: u64,
    /// Upper bound on open connections
    pub max_size: usize,
}

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Open,
    Draining,
    Closed,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Open,
            2 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(PoolState::Created as u8))
    }

    pub(crate) fn load(&self) -> PoolState {
        PoolState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: PoolState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if the state was something else
    pub(crate) fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Busy unless the pool is open
    pub(crate) fn admit(&self) -> Result<()> {
        match self.load() {
            PoolState::Open => Ok(()),
            PoolState::Created => Err(DatabaseError::busy(BusyReason::NotInitialized)),
            PoolState::Draining | PoolState::Closed => {
                Err(DatabaseError::busy(BusyReason::Draining))
            }
        }
    }
}

/// What keeps a lease exclusive (or shared) while it is open
pub(crate) enum LeaseGuard {
    /// Nested lease; the outermost lease of the task holds the real guard
    Nested,
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
    Slot(OwnedSemaphorePermit),
}

/// Parts of a lease dropped without being released
pub(crate) struct AbandonedLease {
    pub(crate) task: TaskId,
    pub(crate) nested: bool,
    pub(crate) handle: ConnectionHandle,
    pub(crate) usage: Option<UsageKey>,
    pub(crate) guard: LeaseGuard,
}

/// Pool bookkeeping a lease reports back to when it is dropped unreleased
pub(crate) trait LeaseLedger: Send + Sync {
    fn abandon(&self, lease: AbandonedLease);
}

/// A connection leased to one task
///
/// Hand it back with [`ConnectionPool::release`]. A lease dropped without release
/// (for example when the owning future is cancelled) is cleaned up by its pool:
/// the guard is freed and any open transaction is rolled back or the connection
/// discarded.
pub struct Lease {
    handle: ConnectionHandle,
    task: TaskId,
    access: Access,
    nested: bool,
    acquired_at: Instant,
    usage: Option<UsageKey>,
    guard: LeaseGuard,
    ledger: Option<Arc<dyn LeaseLedger>>,
}

impl Lease {
    pub(crate) fn new(
        handle: ConnectionHandle,
        task: TaskId,
        access: Access,
        guard: LeaseGuard,
        usage: Option<UsageKey>,
        ledger: Arc<dyn LeaseLedger>,
    ) -> Self {
        let nested = matches!(guard, LeaseGuard::Nested);
        Self {
            handle,
            task,
            access,
            nested,
            acquired_at: Instant::now(),
            usage,
            guard,
            ledger: Some(ledger),
        }
    }

    /// Leased connection
    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Owning task
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Side requested for this lease
    pub fn access(&self) -> Access {
        self.access
    }

    /// True when the task already held a lease on this connection
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Time since the lease was handed out
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Mark the lease as released so dropping it no longer notifies the pool
    pub(crate) fn disarm(&mut self) -> Option<UsageKey> {
        self.ledger = None;
        self.usage.take()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            tracing::warn!(
                task = %self.task,
                connection = self.handle.id(),
                "lease dropped without release"
            );
            ledger.abandon(AbandonedLease {
                task: self.task,
                nested: self.nested,
                handle: self.handle.clone(),
                usage: self.usage.take(),
                guard: std::mem::replace(&mut self.guard, LeaseGuard::Nested),
            });
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.handle.id())
            .field("task", &self.task)
            .field("access", &self.access)
            .field("nested", &self.nested)
            .finish()
    }
}

/// Roll back a connection whose lease ended mid-transaction, off the caller's path
pub(crate) fn rollback_detached(handle: ConnectionHandle, guard: LeaseGuard) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = handle.rollback().await {
                    tracing::error!(connection = handle.id(), error = %e, "rollback of abandoned lease failed");
                }
                drop(guard);
            });
        }
        Err(_) => {
            tracing::error!(
                connection = handle.id(),
                "abandoned lease left a transaction open outside a runtime"
            );
            drop(guard);
        }
    }
}
