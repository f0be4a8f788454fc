//! Driver-facing connection traits and the handles passed to callers
//!
//! A [`Connection`] is one physical backend connection exposing the blocking
//! call/row-cursor primitives of the underlying driver (offloaded from the runtime
//! by each backend). Pools own connections and hand them out as
//! [`ConnectionHandle`]s for the duration of a lease.

use super::dialect::Dialect;
use super::error::Result;
use super::value::{Row, SqlValue};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One physical backend connection
///
/// All methods take `&self`; implementations serialize access to the driver
/// internally so a handle can be shared by the nested calls of one task.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Dialect spoken by this connection
    fn dialect(&self) -> Dialect;

    /// Run a statement, returning the number of affected rows
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run an insert, returning the key generated by the backend if any
    async fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>>;

    /// Run a query and collect its rows
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run several `;`-separated statements without arguments
    async fn execute_batch(&self, sql: &str) -> Result<()>;

    /// Disable auto-commit by opening an explicit transaction
    async fn begin(&self) -> Result<()>;

    /// Commit the open transaction and restore auto-commit
    async fn commit(&self) -> Result<()>;

    /// Roll back the open transaction and restore auto-commit
    async fn rollback(&self) -> Result<()>;

    /// True while auto-commit is disabled
    fn in_transaction(&self) -> bool;

    /// Liveness probe used before a connection goes back to a pool
    async fn is_alive(&self) -> bool;

    /// Close the physical connection
    async fn close(&self) -> Result<()>;
}

/// Opens physical connections for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Dialect of the connections this factory opens
    fn dialect(&self) -> Dialect;

    /// Open a new physical connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Human readable target for logs (path or host:port/db)
    fn describe(&self) -> String;
}

struct PhysicalConnection {
    id: u64,
    established_at: Instant,
    connection: Box<dyn Connection>,
}

/// Shared handle to a leased physical connection
///
/// Cloning is cheap; every clone refers to the same physical connection, which is
/// how nested calls of one task observe the same transaction state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<PhysicalConnection>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, connection: Box<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(PhysicalConnection {
                id,
                established_at: Instant::now(),
                connection,
            }),
        }
    }

    /// Pool-unique identifier of the physical connection
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// When the physical connection was opened
    pub fn established_at(&self) -> Instant {
        self.inner.established_at
    }

    /// True when both handles refer to the same physical connection
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.inner.connection.as_ref()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("dialect", &self.inner.connection.dialect())
            .finish()
    }
}

/// Lock side requested for a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Shared access; only read-only statements may run
    Read,
    /// Exclusive access
    Write,
}

impl Access {
    /// Read iff the trimmed text begins with the `SELECT` keyword (any case); anything else writes
    ///
    /// The keyword must end at whitespace, `(` or the end of the text, so names
    /// that merely start with "select" stay writes.
    pub fn infer(sql: &str) -> Self {
        let head = sql.trim_start();
        let (Some(verb), Some(rest)) = (head.get(..6), head.get(6..)) else {
            return Access::Write;
        };
        let ends_keyword = rest
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '(');
        if verb.eq_ignore_ascii_case("select") && ends_keyword {
            Access::Read
        } else {
            Access::Write
        }
    }

    /// True for [`Access::Read`]
    pub fn is_read(&self) -> bool {
        matches!(self, Access::Read)
    }
}

/// Identity of a logical task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw numeric value, for logs
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task-scoped context threaded through every pool and manager call
///
/// Calls made with the same context while a lease is open reuse that lease's
/// connection. A context belongs to one task: using it from two concurrently
/// running tasks breaks the affinity guarantees and is a caller contract
/// violation.
///
/// Holding a lease obtained under one context while blocking on an acquire under
/// a *different* context can deadlock against a saturated pool; the pool cannot
/// detect this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskContext {
    id: TaskId,
}

impl TaskContext {
    /// Allocate a fresh task identity
    pub fn new() -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Identity used as the affinity key
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}
