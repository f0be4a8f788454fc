//! Connection manager
//!
//! [`ConnectionManager`] is the entry point applications use. It sits on top of
//! any [`ConnectionPool`] and adds:
//!
//! - a one-shot lifecycle (`Created -> Initializing -> Ready -> Closed`) gated
//!   by a caller-supplied bootstrap callback run under a write lease
//! - closures run against a leased connection, optionally inside a transaction
//! - [`Session`], an [`Executor`] that leases per statement using the
//!   statement's inferred access
//! - catalog introspection and pool statistics
//!
//! Every entry point takes the caller's [`TaskContext`]; nested calls made with
//! the same context share one connection and therefore one transaction.

pub mod introspect;

use crate::core::config::ManagerConfig;
use crate::core::connection::{Access, ConnectionHandle, TaskContext, TaskId};
use crate::core::dialect::Dialect;
use crate::core::error::{BusyReason, DatabaseError, Result};
use crate::core::statement::{self, Executor, Outcome, StatementRequest};
use crate::core::transaction::run_in_transaction;
use crate::pool::{ConnectionPool, PoolState, PoolStats, UsageRatios};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Initializing,
    Ready,
    Closed,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Created,
            1 => ManagerState::Initializing,
            2 => ManagerState::Ready,
            _ => ManagerState::Closed,
        }
    }
}

/// Facade over a connection pool
pub struct ConnectionManager {
    pool: Arc<dyn ConnectionPool>,
    config: ManagerConfig,
    state: AtomicU8,
    init_task: Mutex<Option<TaskId>>,
    shutting_down: AtomicBool,
    runtime: Option<tokio::runtime::Handle>,
}

impl ConnectionManager {
    /// Manager over `pool`
    ///
    /// When called from inside a tokio runtime, that runtime is remembered for
    /// [`execute_blocking`](Self::execute_blocking) calls made from plain threads.
    pub fn new(pool: Arc<dyn ConnectionPool>, config: ManagerConfig) -> Self {
        Self {
            pool,
            config,
            state: AtomicU8::new(ManagerState::Created as u8),
            init_task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Manager over a single-connection pool on the SQLite file in `config`
    #[cfg(feature = "sqlite")]
    pub fn sqlite(config: crate::core::config::SqliteConfig, manager: ManagerConfig) -> Self {
        use crate::backends::sqlite::SqliteConnectionFactory;
        use crate::pool::SingleConnectionPool;

        let factory = Arc::new(SqliteConnectionFactory::new(config));
        Self::new(Arc::new(SingleConnectionPool::new(factory)), manager)
    }

    /// Manager over a leased pool on the MySQL server in `config`
    #[cfg(feature = "mysql")]
    pub fn mysql(config: crate::core::config::MysqlConfig, manager: ManagerConfig) -> Self {
        use crate::backends::mysql::MysqlConnectionFactory;
        use crate::pool::LeasedPool;

        let sizing = config.pool_config();
        let factory = Arc::new(MysqlConnectionFactory::new(config));
        Self::new(Arc::new(LeasedPool::new(factory, sizing)), manager)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Dialect of the underlying pool
    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    /// True for the network engine family
    pub fn is_mysql_like(&self) -> bool {
        self.pool.is_mysql_like()
    }

    /// Configuration in effect
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    fn admit(&self, ctx: &TaskContext) -> Result<()> {
        match self.state() {
            ManagerState::Ready => Ok(()),
            ManagerState::Initializing if *self.init_task.lock() == Some(ctx.id()) => Ok(()),
            ManagerState::Created | ManagerState::Initializing => Err(DatabaseError::state(
                "connection manager is not ready; init() has not completed",
            )),
            ManagerState::Closed => Err(DatabaseError::busy(BusyReason::Draining)),
        }
    }

    /// Open the pool and run `bootstrap` under a write lease, exactly once
    ///
    /// While the bootstrap runs, calls made with `ctx` are admitted; everyone else
    /// gets a state error until the manager is ready.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::State`] when called a second time. A failing
    /// pool or bootstrap closes the manager and its error is returned.
    pub async fn init<F, Fut>(&self, ctx: &TaskContext, bootstrap: F) -> Result<()>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .state
            .compare_exchange(
                ManagerState::Created as u8,
                ManagerState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(DatabaseError::state("init() may run only once"));
        }
        *self.init_task.lock() = Some(ctx.id());
        tracing::info!(dialect = %self.dialect(), task = %ctx.id(), "initializing connection manager");

        let result = match self.pool.initialize().await {
            Ok(()) => {
                self.with_lease(ctx, Access::Write, self.config.acquire_timeout(), bootstrap)
                    .await
            }
            Err(e) => Err(e),
        };
        *self.init_task.lock() = None;

        match result {
            Ok(()) => {
                self.set_state(ManagerState::Ready);
                tracing::info!(dialect = %self.dialect(), "connection manager ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "connection manager initialization failed");
                self.set_state(ManagerState::Closed);
                if let Err(close_err) = self.pool.close().await {
                    tracing::warn!(error = %close_err, "closing pool after failed init");
                }
                Err(e)
            }
        }
    }

    async fn with_lease<T, F, Fut>(
        &self,
        ctx: &TaskContext,
        access: Access,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.pool.acquire(ctx, access, timeout).await?;
        let result = f(lease.connection().clone()).await;
        let released = self.pool.release(lease).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::error!(error = %release_err, "release failed after an operation error");
                Err(e)
            }
        }
    }

    /// Run `f` with a connection leased for `access`, waiting the configured timeout
    pub async fn execute<T, F, Fut>(&self, ctx: &TaskContext, access: Access, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_timeout(ctx, access, self.config.acquire_timeout(), f)
            .await
    }

    /// Run `f` with a connection leased for `access`, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Busy`] when no lease was available in time, a
    /// state error before `init()` completed, or whatever `f` returns.
    pub async fn execute_timeout<T, F, Fut>(
        &self,
        ctx: &TaskContext,
        access: Access,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(ctx)?;
        self.with_lease(ctx, access, timeout, f).await
    }

    /// Run `f` inside a transaction under a write lease
    pub async fn execute_transaction<T, F, Fut>(&self, ctx: &TaskContext, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_transaction_timeout(ctx, self.config.acquire_timeout(), f)
            .await
    }

    /// Run `f` inside a transaction, waiting at most `timeout` for the lease
    ///
    /// Commits when `f` succeeds. On any failure, including one raised by a nested
    /// call on the same context, the transaction is rolled back, auto-commit is
    /// restored and the original error is returned. Called from inside another
    /// transaction of the same context, `f` joins it.
    pub async fn execute_transaction_timeout<T, F, Fut>(
        &self,
        ctx: &TaskContext,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(ctx)?;
        self.with_lease(ctx, Access::Write, timeout, |conn| run_in_transaction(conn, f))
            .await
    }

    /// Run `f` in a transaction and report whether its result is committed
    ///
    /// The flag is false when `f` joined an enclosing transaction of the same
    /// context: that outer transaction may still roll back, so nothing derived
    /// from the result should outlive it (caches in particular).
    pub async fn execute_transaction_committed<T, F, Fut>(
        &self,
        ctx: &TaskContext,
        f: F,
    ) -> Result<(T, bool)>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(ctx)?;
        self.with_lease(ctx, Access::Write, self.config.acquire_timeout(), |conn| async move {
            let joined = conn.in_transaction();
            let value = run_in_transaction(conn, f).await?;
            Ok((value, !joined))
        })
        .await
    }

    /// Executor that leases a connection for each statement it runs
    pub fn session<'a>(&'a self, ctx: &'a TaskContext) -> Session<'a> {
        Session {
            manager: self,
            ctx,
            timeout: self.config.acquire_timeout(),
        }
    }

    /// Allow [`execute_blocking`](Self::execute_blocking) from runtime threads during teardown
    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
        tracing::info!("connection manager marked as shutting down");
    }

    /// True once [`mark_shutting_down`](Self::mark_shutting_down) was called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Synchronous variant of [`execute`](Self::execute)
    ///
    /// Meant for plain threads. From a runtime worker it is rejected, since
    /// blocking there can starve the tasks holding the connections it waits for,
    /// unless the manager was marked as shutting down; it then blocks in place,
    /// which requires the multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::State`] when called from a runtime worker without
    /// the shutdown flag, or when no runtime is available to drive the call.
    pub fn execute_blocking<T, F, Fut>(&self, ctx: &TaskContext, access: Access, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(current) => {
                if !self.is_shutting_down() {
                    return Err(DatabaseError::state(
                        "blocking call from inside an async runtime; use execute() instead",
                    ));
                }
                if current.runtime_flavor() != tokio::runtime::RuntimeFlavor::MultiThread {
                    return Err(DatabaseError::state(
                        "blocking call during shutdown needs the multi-threaded runtime",
                    ));
                }
                tokio::task::block_in_place(|| current.block_on(self.execute(ctx, access, f)))
            }
            Err(_) => match &self.runtime {
                Some(runtime) => runtime.block_on(self.execute(ctx, access, f)),
                None => Err(DatabaseError::state(
                    "no tokio runtime available for a blocking call",
                )),
            },
        }
    }

    /// Stop admitting work and close the pool once leases come back
    pub async fn close(&self) -> Result<()> {
        let previous = ManagerState::from_u8(
            self.state
                .swap(ManagerState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ManagerState::Closed {
            return Ok(());
        }
        tracing::info!(dialect = %self.dialect(), "closing connection manager");
        self.pool.close().await
    }

    /// Utilization over the trailing 5 minutes, 1 minute and 5 seconds
    pub fn usage_ratios(&self) -> UsageRatios {
        self.pool.usage_ratios()
    }

    /// Connection counts
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Pool lifecycle state
    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    /// True when `error` reports a unique or primary key violation
    ///
    /// Errors converted from the drivers are already classified; unclassified
    /// backend errors carrying a code are looked up in the pool's dialect.
    pub fn is_constraint_violation(&self, error: &DatabaseError) -> bool {
        match error {
            DatabaseError::ConstraintViolation { .. } => true,
            DatabaseError::Backend {
                code: Some(code), ..
            } => self.dialect().is_constraint_violation_code(*code),
            _ => false,
        }
    }

    /// True when `table` exists
    pub async fn table_exists(&self, ctx: &TaskContext, table: &str) -> Result<bool> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::table_exists(&conn, table).await
        })
        .await
    }

    /// True when `table` has `column`
    pub async fn column_exists(&self, ctx: &TaskContext, table: &str, column: &str) -> Result<bool> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::column_exists(&conn, table, column).await
        })
        .await
    }

    /// True when `table` has an index named `index`
    pub async fn index_exists(&self, ctx: &TaskContext, table: &str, index: &str) -> Result<bool> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::index_exists(&conn, table, index).await
        })
        .await
    }

    /// True when a unique constraint on `table` covers exactly `columns`
    pub async fn unique_constraint_exists(
        &self,
        ctx: &TaskContext,
        table: &str,
        columns: &[&str],
    ) -> Result<bool> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::unique_constraint_exists(&conn, table, columns).await
        })
        .await
    }

    /// True when `table` has a primary key
    pub async fn primary_key_exists(&self, ctx: &TaskContext, table: &str) -> Result<bool> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::primary_key_exists(&conn, table).await
        })
        .await
    }

    /// Number of rows in `table`
    pub async fn row_count(&self, ctx: &TaskContext, table: &str) -> Result<i64> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::row_count(&conn, table).await
        })
        .await
    }

    /// Hash of the current schema shape
    pub async fn schema_hash(&self, ctx: &TaskContext) -> Result<String> {
        self.execute(ctx, Access::Read, |conn| async move {
            introspect::schema_hash(&conn).await
        })
        .await
    }
}

/// [`Executor`] bound to a manager and a task context
///
/// Each request takes its own lease (read or write, as inferred from the
/// statement) unless the context already holds one, in which case it runs on
/// that connection.
pub struct Session<'a> {
    manager: &'a ConnectionManager,
    ctx: &'a TaskContext,
    timeout: Duration,
}

impl<'a> Session<'a> {
    /// Use `timeout` instead of the manager's default acquisition timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Context this session leases for
    pub fn context(&self) -> &TaskContext {
        self.ctx
    }
}

#[async_trait]
impl Executor for Session<'_> {
    async fn run(&self, request: StatementRequest) -> Result<Outcome> {
        let access = request.access();
        self.manager
            .execute_timeout(self.ctx, access, self.timeout, |conn| async move {
                statement::run(request, &conn).await
            })
            .await
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::core::config::SqliteConfig;
    use crate::core::statement::Statement;

    fn manager(dir: &tempfile::TempDir) -> ConnectionManager {
        ConnectionManager::sqlite(
            SqliteConfig::new(dir.path().join("m.db")),
            ManagerConfig::default().with_acquire_timeout(Duration::from_millis(200)),
        )
    }

    async fn bootstrap(conn: ConnectionHandle) -> Result<()> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT UNIQUE)")
            .await
    }

    #[tokio::test]
    async fn test_calls_before_init_are_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();

        let err = manager
            .execute(&ctx, Access::Read, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
        assert_eq!(manager.state(), ManagerState::Created);
    }

    #[tokio::test]
    async fn test_init_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();

        manager.init(&ctx, bootstrap).await.unwrap();
        assert_eq!(manager.state(), ManagerState::Ready);
        assert!(manager.table_exists(&ctx, "t").await.unwrap());

        let err = manager.init(&ctx, bootstrap).await.unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_may_call_back_into_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();

        manager
            .init(&ctx, |conn| {
                let manager = &manager;
                let ctx = &ctx;
                async move {
                    bootstrap(conn).await?;
                    let exists = manager.table_exists(ctx, "t").await?;
                    assert!(exists);
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_init_closes_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();

        let err = manager
            .init(&ctx, |_| async { Err(DatabaseError::backend(None, "boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Backend { .. }));
        assert_eq!(manager.state(), ManagerState::Closed);

        let err = manager
            .execute(&ctx, Access::Read, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[tokio::test]
    async fn test_session_runs_statements() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, bootstrap).await.unwrap();

        let session = manager.session(&ctx);
        let id = Statement::new("INSERT INTO t (v) VALUES (?)")
            .bind("x")
            .generated_key(&session)
            .await
            .unwrap();
        let row = Statement::new("SELECT id FROM t WHERE v = ?")
            .bind("x")
            .fetch_optional(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get_i64("id").unwrap(), id);
        assert_eq!(manager.stats().active, 0);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_nested_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, bootstrap).await.unwrap();

        let err = manager
            .execute_transaction(&ctx, |conn| {
                let manager = &manager;
                let ctx = &ctx;
                async move {
                    Statement::new("INSERT INTO t (v) VALUES ('a')").execute(&conn).await?;
                    manager
                        .execute(ctx, Access::Write, |nested| async move {
                            assert!(nested.same_connection(&conn));
                            Statement::new("INSERT INTO t (v) VALUES ('a')")
                                .execute(&nested)
                                .await
                        })
                        .await
                }
            })
            .await
            .unwrap_err();

        assert!(manager.is_constraint_violation(&err));
        assert_eq!(manager.row_count(&ctx, "t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_call_rejected_on_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, bootstrap).await.unwrap();

        let err = manager
            .execute_blocking(&ctx, Access::Read, |_| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
    }

    #[test]
    fn test_blocking_call_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let err = manager
            .execute_blocking(&TaskContext::new(), Access::Read, |_| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call_allowed_when_shutting_down() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, bootstrap).await.unwrap();

        manager.mark_shutting_down();
        let n = manager
            .execute_blocking(&ctx, Access::Read, |conn| async move {
                introspect::row_count(&conn, "t").await
            })
            .unwrap();
        assert_eq!(n, 0);
        manager.close().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Closed);
    }
}
