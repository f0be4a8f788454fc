//! Integration tests for the connection manager
//!
//! These tests drive the public API end to end against SQLite files:
//! - Lease affinity and read/write exclusion
//! - Bounded waits
//! - Transaction atomicity across nested calls
//! - Concurrent interning
//! - Lifecycle and shutdown

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use rust_connection_manager::backends::SqliteConnectionFactory;
    use rust_connection_manager::core::{BusyReason, ErrorKind, LeasedPoolConfig, Migration, Migrations};
    use rust_connection_manager::pool::LeasedPool;
    use rust_connection_manager::prelude::*;
    use rust_connection_manager::services::{IdManager, Setting, SettingsManager};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn single(dir: &TempDir) -> ConnectionManager {
        ConnectionManager::sqlite(
            SqliteConfig::new(dir.path().join("single.db")),
            ManagerConfig::default().with_acquire_timeout(Duration::from_secs(5)),
        )
    }

    fn leased(dir: &TempDir, max_size: usize) -> ConnectionManager {
        let factory = Arc::new(SqliteConnectionFactory::new(SqliteConfig::new(
            dir.path().join("leased.db"),
        )));
        let pool = LeasedPool::new(factory, LeasedPoolConfig::new(max_size).with_min_idle(1));
        ConnectionManager::new(Arc::new(pool), ManagerConfig::default())
    }

    async fn create_items(conn: ConnectionHandle) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
        )
        .await
    }

    #[tokio::test]
    async fn test_nested_calls_reuse_connection() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = leased(&dir, 3);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");

        manager
            .execute(&ctx, Access::Read, |outer| {
                let manager = &manager;
                let ctx = &ctx;
                async move {
                    let nested = manager
                        .execute(ctx, Access::Read, |inner| async move { Ok(inner) })
                        .await?;
                    assert!(nested.same_connection(&outer));

                    let other_ctx = TaskContext::new();
                    let other = manager
                        .execute(&other_ctx, Access::Read, |inner| async move { Ok(inner) })
                        .await?;
                    assert!(!other.same_connection(&outer));
                    Ok(())
                }
            })
            .await
            .expect("Nested calls failed");

        assert_eq!(manager.stats().active, 0);
        assert_eq!(manager.stats().max_size, 3);
    }

    #[tokio::test]
    async fn test_readers_share_and_writer_waits() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = single(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");

        let result = manager
            .execute(&ctx, Access::Read, |_| {
                let manager = &manager;
                async move {
                    let reader = TaskContext::new();
                    manager
                        .execute_timeout(&reader, Access::Read, Duration::from_millis(50), |_| async {
                            Ok(())
                        })
                        .await?;

                    let writer = TaskContext::new();
                    manager
                        .execute_timeout(&writer, Access::Write, Duration::from_millis(50), |_| async {
                            Ok(())
                        })
                        .await
                }
            })
            .await;

        let err = result.expect_err("Writer should not get in while a reader holds the lock");
        assert!(err.is_busy());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = leased(&dir, 1);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");

        let err = manager
            .execute(&ctx, Access::Write, |_| {
                let manager = &manager;
                async move {
                    let other = TaskContext::new();
                    manager
                        .execute_timeout(&other, Access::Read, Duration::from_millis(30), |_| async {
                            Ok(())
                        })
                        .await
                }
            })
            .await
            .expect_err("Second task should time out");

        match err {
            DatabaseError::Busy {
                reason: BusyReason::Timeout { waited_ms },
            } => assert!(waited_ms >= 30),
            other => panic!("Unexpected error: {}", other),
        }

        // The pool recovers once the holder is gone
        manager
            .execute(&TaskContext::new(), Access::Read, |_| async { Ok(()) })
            .await
            .expect("Pool should be usable again");
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = single(&dir);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");

        let err = manager
            .execute_transaction(&ctx, |conn| async move {
                Statement::new("INSERT INTO items (name) VALUES (?)")
                    .bind("first")
                    .execute(&conn)
                    .await?;
                Statement::new("INSERT INTO items (name) VALUES (?)")
                    .bind("second")
                    .execute(&conn)
                    .await?;
                Statement::new("INSERT INTO items (name) VALUES (?)")
                    .bind("first")
                    .execute(&conn)
                    .await
            })
            .await
            .expect_err("Duplicate should fail the transaction");

        assert!(err.is_constraint_violation());
        assert!(manager.is_constraint_violation(&err));
        assert!(!err.is_retryable());
        assert_eq!(manager.row_count(&ctx, "items").await.expect("Count failed"), 0);

        manager
            .execute_transaction(&ctx, |conn| async move {
                Statement::new("INSERT INTO items (name) VALUES (?)")
                    .bind("kept")
                    .execute(&conn)
                    .await
            })
            .await
            .expect("Commit failed");
        assert_eq!(manager.row_count(&ctx, "items").await.expect("Count failed"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_interning_yields_one_id() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = Arc::new(single(&dir));
        let ctx = TaskContext::new();
        manager.init(&ctx, |_| async { Ok(()) }).await.expect("Init failed");

        let ids = Arc::new(IdManager::new(manager.clone(), "interned").expect("Bad table"));
        ids.migrate(&ctx).await.expect("Migrate failed");

        let mut handles = vec![];
        for _ in 0..50 {
            let ids = Arc::clone(&ids);
            handles.push(tokio::spawn(async move {
                let ctx = TaskContext::new();
                ids.get_or_insert(&ctx, "shared").await
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.expect("Task panicked").expect("Interning failed"));
        }
        seen.dedup();
        assert_eq!(seen.len(), 1);
        assert_eq!(manager.row_count(&ctx, "interned").await.expect("Count failed"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_interning_across_connections() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = Arc::new(leased(&dir, 4));
        let ctx = TaskContext::new();
        manager.init(&ctx, |_| async { Ok(()) }).await.expect("Init failed");

        let ids = Arc::new(
            IdManager::new(manager.clone(), "interned")
                .expect("Bad table")
                .with_deadlock_retries(20, Duration::from_millis(5)),
        );
        ids.migrate(&ctx).await.expect("Migrate failed");

        let mut handles = vec![];
        for i in 0..50 {
            let ids = Arc::clone(&ids);
            handles.push(tokio::spawn(async move {
                let ctx = TaskContext::new();
                let value = if i % 2 == 0 { "even" } else { "odd" };
                ids.get_or_insert(&ctx, value).await.map(|id| (value, id))
            }));
        }

        let mut even = Vec::new();
        let mut odd = Vec::new();
        for handle in handles {
            let (value, id) = handle.await.expect("Task panicked").expect("Interning failed");
            if value == "even" {
                even.push(id);
            } else {
                odd.push(id);
            }
        }
        even.dedup();
        odd.dedup();
        assert_eq!(even.len(), 1);
        assert_eq!(odd.len(), 1);
        assert_ne!(even[0], odd[0]);
        assert_eq!(manager.row_count(&ctx, "interned").await.expect("Count failed"), 2);
        assert!(manager.stats().total_established > 1);
    }

    #[tokio::test]
    async fn test_migrations_run_from_bootstrap() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = single(&dir);
        let ctx = TaskContext::new();
        let migrations = Migrations::new()
            .with(Migration::new(1, "create_users", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"))
            .with(Migration::new(2, "add_email", "ALTER TABLE users ADD COLUMN email TEXT"));

        manager
            .init(&ctx, |conn| async move { migrations.apply(&conn).await.map(|_| ()) })
            .await
            .expect("Init failed");

        assert!(manager.column_exists(&ctx, "users", "email").await.expect("Lookup failed"));
        assert!(manager.primary_key_exists(&ctx, "users").await.expect("Lookup failed"));
        assert!(manager.table_exists(&ctx, "schema_migrations").await.expect("Lookup failed"));
        assert_eq!(manager.schema_hash(&ctx).await.expect("Hash failed").len(), 64);
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = Arc::new(single(&dir));
        let ctx = TaskContext::new();
        manager.init(&ctx, |_| async { Ok(()) }).await.expect("Init failed");

        let settings = SettingsManager::new(manager, "settings").expect("Bad table");
        settings.create_table(&ctx).await.expect("Create failed");

        let limit = Setting::new("page_size", 25u32);
        assert_eq!(assert_ok!(settings.get(&ctx, 1, &limit).await), 25);
        assert_ok!(settings.set(&ctx, 1, &limit, &100).await);
        assert_eq!(assert_ok!(settings.get(&ctx, 1, &limit).await), 100);

        // Stored JSON that does not decode as the requested type is an error
        let as_text = Setting::new("page_size", String::new());
        let err = assert_err!(settings.get(&ctx, 1, &as_text).await);
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_usage_ratios_reflect_held_leases() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = leased(&dir, 2);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");

        manager
            .execute(&ctx, Access::Read, |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
            .expect("Execute failed");

        let ratios = manager.usage_ratios();
        assert!(ratios.five_seconds > 0.0);
        assert!(ratios.five_seconds >= ratios.five_minutes);
    }

    #[tokio::test]
    async fn test_close_rejects_new_work() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = leased(&dir, 2);
        let ctx = TaskContext::new();
        manager.init(&ctx, create_items).await.expect("Init failed");
        assert_eq!(manager.pool_state(), PoolState::Open);

        manager.close().await.expect("Close failed");
        assert_eq!(manager.state(), ManagerState::Closed);
        assert_eq!(manager.pool_state(), PoolState::Closed);

        let err = manager
            .execute(&ctx, Access::Read, |_| async { Ok(()) })
            .await
            .expect_err("Closed manager should reject work");
        assert!(matches!(
            err,
            DatabaseError::Busy {
                reason: BusyReason::Draining
            }
        ));

        // Closing twice is harmless
        manager.close().await.expect("Second close failed");
    }
}
