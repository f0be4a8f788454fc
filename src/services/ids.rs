//! Race-safe interning of values into small integer ids
//!
//! Each [`IdManager`] owns one two-column table `(id, value)` with a unique
//! constraint on `value`. Concurrent callers interning the same value all end up
//! with the same id: the insert of every caller but one fails with a constraint
//! violation, which is expected and followed by a lookup in the same transaction.

use super::cache::BiCache;
use crate::core::connection::{Access, ConnectionHandle, TaskContext};
use crate::core::error::{DatabaseError, Result};
use crate::core::statement::Statement;
use crate::manager::introspect;
use crate::manager::ConnectionManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_DEADLOCK_ATTEMPTS: u32 = 5;
const DEFAULT_DEADLOCK_BACKOFF: Duration = Duration::from_millis(20);

/// A row dropped while rebuilding a table because its value was already taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub id: i64,
    pub value: Option<String>,
}

/// What [`IdManager::migrate`] did to the table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Table did not exist and was created
    pub created: bool,
    /// Table lacked the unique constraint and was rebuilt
    pub rebuilt: bool,
    /// Rows carried over by the rebuild, ids preserved
    pub copied: usize,
    /// Rows left behind by the rebuild
    pub collisions: Vec<Collision>,
}

/// Interning table plus its two-way cache
pub struct IdManager {
    manager: Arc<ConnectionManager>,
    table: String,
    cache: BiCache<String>,
    deadlock_attempts: u32,
    deadlock_backoff: Duration,
}

impl IdManager {
    /// Manager for `table`
    ///
    /// # Errors
    ///
    /// Returns a usage error when `table` is not a plain identifier.
    pub fn new(manager: Arc<ConnectionManager>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        introspect::validate_identifier(&table)?;
        Ok(Self {
            manager,
            table,
            cache: BiCache::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL),
            deadlock_attempts: DEFAULT_DEADLOCK_ATTEMPTS,
            deadlock_backoff: DEFAULT_DEADLOCK_BACKOFF,
        })
    }

    /// Replace the cache with one of `capacity` entries living `ttl`
    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache = BiCache::new(capacity, ttl);
        self
    }

    /// Give up after `attempts` deadlocked tries, sleeping `backoff * attempt` between them
    pub fn with_deadlock_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.deadlock_attempts = attempts.max(1);
        self.deadlock_backoff = backoff;
        self
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_sql(&self, table: &str) -> String {
        let dialect = self.manager.dialect();
        format!(
            "CREATE TABLE {} ({}, value VARCHAR(255) NOT NULL, UNIQUE (value))",
            table,
            dialect.auto_increment_primary_key("id")
        )
    }

    /// Run `op`, retrying it while the backend reports a deadlock
    async fn retry_on_deadlock<T, F, Fut>(&self, value: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if e.is_deadlock() => {
                    if attempt >= self.deadlock_attempts {
                        tracing::error!(table = %self.table, value, attempts = attempt, "deadlock retries exhausted");
                        return Err(DatabaseError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    tracing::warn!(table = %self.table, value, attempt, error = %e, "deadlock while interning, retrying");
                    tokio::time::sleep(self.deadlock_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn select_id(&self, conn: &ConnectionHandle, value: &str) -> Result<Option<i64>> {
        Statement::new(format!("SELECT id FROM {} WHERE value = ?", self.table))
            .bind(value)
            .fetch_optional(conn)
            .await?
            .map(|row| row.get_i64("id"))
            .transpose()
    }

    async fn insert_then_select(&self, ctx: &TaskContext, value: &str) -> Result<(i64, bool)> {
        self.manager
            .execute_transaction_committed(ctx, |conn| async move {
                let inserted = Statement::new(format!("INSERT INTO {} (value) VALUES (?)", self.table))
                    .bind(value)
                    .execute(&conn)
                    .await;
                match inserted {
                    Ok(()) => {}
                    Err(e) if e.is_constraint_violation() => {
                        tracing::debug!(table = %self.table, value, "value already interned");
                    }
                    Err(e) => return Err(e),
                }
                self.select_id(&conn, value).await?.ok_or_else(|| {
                    DatabaseError::state(format!(
                        "'{}' missing from {} right after interning",
                        value, self.table
                    ))
                })
            })
            .await
    }

    /// Cache `id <-> value` only once storage durably holds it
    fn remember(&self, id: i64, value: &str, committed: bool) {
        if committed {
            self.cache.put(id, value.to_string());
        } else {
            tracing::debug!(table = %self.table, id, value, "not caching id from an uncommitted transaction");
        }
    }

    /// Id of `value`, interning it first when needed
    ///
    /// Called inside an enclosing transaction of the same context, the id is
    /// only cached after a later call sees it committed.
    ///
    /// # Errors
    ///
    /// Deadlocks are retried; running out of attempts returns
    /// [`DatabaseError::RetriesExhausted`]. Every other failure propagates.
    pub async fn get_or_insert(&self, ctx: &TaskContext, value: &str) -> Result<i64> {
        if let Some(id) = self.cache.get_id(&value.to_string()) {
            return Ok(id);
        }
        let (id, committed) = self
            .retry_on_deadlock(value, || self.insert_then_select(ctx, value))
            .await?;
        self.remember(id, value, committed);
        Ok(id)
    }

    /// Intern `value`, which the caller asserts is new
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConstraintViolation`] when `value` already exists.
    pub async fn get_require_new(&self, ctx: &TaskContext, value: &str) -> Result<i64> {
        let (id, committed) = self
            .retry_on_deadlock(value, || {
                self.manager.execute_transaction_committed(ctx, |conn| async move {
                    Statement::new(format!("INSERT INTO {} (value) VALUES (?)", self.table))
                        .bind(value)
                        .generated_key(&conn)
                        .await
                })
            })
            .await?;
        self.remember(id, value, committed);
        Ok(id)
    }

    /// Id of `value` if it was interned
    pub async fn get_id(&self, ctx: &TaskContext, value: &str) -> Result<Option<i64>> {
        if let Some(id) = self.cache.get_id(&value.to_string()) {
            return Ok(Some(id));
        }
        let (id, committed) = self
            .manager
            .execute(ctx, Access::Read, |conn| async move {
                let id = self.select_id(&conn, value).await?;
                Ok((id, !conn.in_transaction()))
            })
            .await?;
        if let Some(id) = id {
            self.remember(id, value, committed);
        }
        Ok(id)
    }

    /// Value interned under `id`
    pub async fn get_value(&self, ctx: &TaskContext, id: i64) -> Result<Option<String>> {
        if let Some(value) = self.cache.get_value(id) {
            return Ok(Some(value));
        }
        let (value, committed) = self
            .manager
            .execute(ctx, Access::Read, |conn| async move {
                let value = Statement::new(format!("SELECT value FROM {} WHERE id = ?", self.table))
                    .bind(id)
                    .fetch_optional(&conn)
                    .await?
                    .map(|row| row.get_string("value"))
                    .transpose()?;
                Ok((value, !conn.in_transaction()))
            })
            .await?;
        if let Some(value) = &value {
            self.remember(id, value, committed);
        }
        Ok(value)
    }

    /// Create the table, or rebuild one that lacks the unique constraint on `value`
    ///
    /// A rebuild copies rows in id order, preserving ids. Rows whose value is
    /// already present (or null) are left behind and listed in the report instead
    /// of failing the migration.
    pub async fn migrate(&self, ctx: &TaskContext) -> Result<RebuildReport> {
        let report = self
            .manager
            .execute_transaction(ctx, |conn| async move { self.migrate_on(&conn).await })
            .await?;
        if report.rebuilt {
            self.cache.clear();
        }
        Ok(report)
    }

    /// [`migrate`](Self::migrate) on an already-leased connection, e.g. from a bootstrap callback
    pub async fn migrate_on(&self, conn: &ConnectionHandle) -> Result<RebuildReport> {
        let table = self.table.as_str();
        if !introspect::table_exists(conn, table).await? {
            conn.execute_batch(&self.create_sql(table)).await?;
            tracing::info!(table, "created interning table");
            return Ok(RebuildReport {
                created: true,
                ..Default::default()
            });
        }
        if introspect::unique_constraint_exists(conn, table, &["value"]).await? {
            return Ok(RebuildReport::default());
        }

        tracing::warn!(table, "interning table lacks a unique constraint, rebuilding");
        let staging = format!("{}_rebuild", table);
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", staging))
            .await?;
        conn.execute_batch(&self.create_sql(&staging)).await?;

        let rows = Statement::new(format!("SELECT id, value FROM {} ORDER BY id", table))
            .fetch_all(conn)
            .await?;
        let mut report = RebuildReport {
            rebuilt: true,
            ..Default::default()
        };
        for row in rows {
            let id = row.get_i64("id")?;
            let Some(value) = row.get_opt_string("value")? else {
                tracing::warn!(table, id, "dropping row with null value during rebuild");
                report.collisions.push(Collision { id, value: None });
                continue;
            };
            let copied = Statement::new(format!("INSERT INTO {} (id, value) VALUES (?, ?)", staging))
                .bind(id)
                .bind(value.as_str())
                .execute(conn)
                .await;
            match copied {
                Ok(()) => report.copied += 1,
                Err(e) if e.is_constraint_violation() => {
                    tracing::warn!(table, id, value = %value, "duplicate value dropped during rebuild");
                    report.collisions.push(Collision { id, value: Some(value) });
                }
                Err(e) => return Err(e),
            }
        }

        conn.execute_batch(&format!("DROP TABLE {}", table)).await?;
        conn.execute_batch(&conn.dialect().rename_table(&staging, table))
            .await?;
        tracing::info!(
            table,
            copied = report.copied,
            collisions = report.collisions.len(),
            "rebuilt interning table"
        );
        Ok(report)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::core::config::{ManagerConfig, SqliteConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn manager(dir: &tempfile::TempDir) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::sqlite(
            SqliteConfig::new(dir.path().join("ids.db")),
            ManagerConfig::default(),
        );
        manager
            .init(&TaskContext::new(), |_| async { Ok(()) })
            .await
            .unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_get_or_insert_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = TaskContext::new();
        let ids = IdManager::new(manager.clone(), "names").unwrap();
        assert!(ids.migrate(&ctx).await.unwrap().created);

        let a = ids.get_or_insert(&ctx, "alpha").await.unwrap();
        let b = ids.get_or_insert(&ctx, "beta").await.unwrap();
        assert_ne!(a, b);

        // Bypass the cache
        let fresh = IdManager::new(manager.clone(), "names").unwrap();
        assert_eq!(fresh.get_or_insert(&ctx, "alpha").await.unwrap(), a);
        assert_eq!(fresh.get_value(&ctx, b).await.unwrap().as_deref(), Some("beta"));
        assert_eq!(fresh.get_id(&ctx, "gamma").await.unwrap(), None);
        assert_eq!(manager.row_count(&ctx, "names").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_require_new_propagates_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = TaskContext::new();
        let ids = IdManager::new(manager, "names").unwrap();
        ids.migrate(&ctx).await.unwrap();

        let id = ids.get_require_new(&ctx, "x").await.unwrap();
        assert_eq!(ids.get_or_insert(&ctx, "x").await.unwrap(), id);

        let err = ids.get_require_new(&ctx, "x").await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_rebuild_preserves_ids_and_reports_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = TaskContext::new();
        manager
            .execute(&ctx, Access::Write, |conn| async move {
                conn.execute_batch(
                    "CREATE TABLE legacy (id INTEGER PRIMARY KEY, value TEXT); \
                     INSERT INTO legacy (id, value) VALUES (3, 'a'), (5, 'b'), (8, 'a'), (9, NULL);",
                )
                .await
            })
            .await
            .unwrap();

        let ids = IdManager::new(manager.clone(), "legacy").unwrap();
        let report = ids.migrate(&ctx).await.unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.copied, 2);
        assert_eq!(
            report.collisions,
            vec![
                Collision { id: 8, value: Some("a".to_string()) },
                Collision { id: 9, value: None },
            ]
        );

        assert_eq!(ids.get_or_insert(&ctx, "a").await.unwrap(), 3);
        assert_eq!(ids.get_or_insert(&ctx, "b").await.unwrap(), 5);
        assert!(manager
            .unique_constraint_exists(&ctx, "legacy", &["value"])
            .await
            .unwrap());

        // Second run is a no-op
        assert_eq!(ids.migrate(&ctx).await.unwrap(), RebuildReport::default());
    }

    #[tokio::test]
    async fn test_rolled_back_outer_transaction_leaves_cache_clean() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = TaskContext::new();
        let ids = IdManager::new(manager.clone(), "names").unwrap();
        ids.migrate(&ctx).await.unwrap();

        let err = manager
            .execute_transaction(&ctx, |_| {
                let ids = &ids;
                let ctx = &ctx;
                async move {
                    let x = ids.get_or_insert(ctx, "x").await?;
                    assert_eq!(ids.get_id(ctx, "x").await?, Some(x));
                    assert_eq!(ids.get_value(ctx, x).await?.as_deref(), Some("x"));
                    Err::<(), _>(DatabaseError::state("abort"))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::State(_)));
        assert_eq!(manager.row_count(&ctx, "names").await.unwrap(), 0);

        let y = ids.get_or_insert(&ctx, "y").await.unwrap();
        let x = ids.get_or_insert(&ctx, "x").await.unwrap();
        assert_ne!(x, y);
        assert_eq!(ids.get_value(&ctx, y).await.unwrap().as_deref(), Some("y"));
        assert_eq!(ids.get_value(&ctx, x).await.unwrap().as_deref(), Some("x"));
        assert_eq!(manager.row_count(&ctx, "names").await.unwrap(), 2);
    }

    fn deadlock() -> DatabaseError {
        DatabaseError::Deadlock {
            code: 1213,
            message: "Deadlock found when trying to get lock".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deadlock_is_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdManager::new(manager(&dir).await, "names")
            .unwrap()
            .with_deadlock_retries(5, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let id = ids
            .retry_on_deadlock("v", || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(deadlock())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(id, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadlock_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdManager::new(manager(&dir).await, "names")
            .unwrap()
            .with_deadlock_retries(3, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let err = ids
            .retry_on_deadlock("v", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i64, _>(deadlock()) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!err.is_retryable());
        match err {
            DatabaseError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_deadlock());
            }
            other => panic!("Unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_other_faults_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdManager::new(manager(&dir).await, "names")
            .unwrap()
            .with_deadlock_retries(5, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let err = ids
            .retry_on_deadlock("v", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<i64, _>(DatabaseError::ConstraintViolation {
                        code: 2067,
                        message: "UNIQUE constraint failed".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_table_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        assert!(matches!(
            IdManager::new(manager, "names; --"),
            Err(DatabaseError::Usage(_))
        ));
    }
}
