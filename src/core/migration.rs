//! Versioned schema migrations
//!
//! A [`Migrations`] set is applied from the manager's bootstrap callback, on the
//! write-leased connection it receives. Applied versions are recorded in a
//! tracking table (`schema_migrations` by default) so running the set again only
//! applies what is new.
//!
//! # Example
//!
//! ```rust,no_run
//! use rust_connection_manager::core::{Migration, Migrations};
//! use rust_connection_manager::prelude::*;
//!
//! # async fn example(manager: &ConnectionManager) -> Result<()> {
//! let migrations = Migrations::new()
//!     .with(Migration::new(1, "create_users", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"))
//!     .with(Migration::new(2, "add_email", "ALTER TABLE users ADD COLUMN email TEXT"));
//!
//! let ctx = TaskContext::new();
//! manager
//!     .init(&ctx, |conn| async move { migrations.apply(&conn).await.map(|_| ()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use super::connection::ConnectionHandle;
use super::error::{DatabaseError, Result};
use super::statement::Statement;
use super::transaction::run_in_transaction;
use std::collections::BTreeMap;

/// One forward schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    version: i64,
    name: String,
    up_sql: String,
}

impl Migration {
    /// Migration `version`; `up_sql` may hold several `;`-separated statements
    pub fn new(version: i64, name: impl Into<String>, up_sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up_sql: up_sql.into(),
        }
    }

    /// Version number
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Descriptive name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SQL applied by this migration
    pub fn up_sql(&self) -> &str {
        &self.up_sql
    }
}

/// Status of a migration against one database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Applied,
    Pending,
}

/// Ordered set of migrations
#[derive(Debug, Clone)]
pub struct Migrations {
    migrations: BTreeMap<i64, Migration>,
    table_name: String,
}

impl Default for Migrations {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrations {
    /// Default tracking table
    pub const DEFAULT_TABLE_NAME: &'static str = "schema_migrations";

    /// Empty set tracked in `schema_migrations`
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
            table_name: Self::DEFAULT_TABLE_NAME.to_string(),
        }
    }

    /// Track applied versions in `table_name` instead
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Add a migration, replacing any with the same version
    pub fn with(mut self, migration: Migration) -> Self {
        self.add(migration);
        self
    }

    /// Add a migration, replacing any with the same version
    pub fn add(&mut self, migration: Migration) {
        self.migrations.insert(migration.version, migration);
    }

    /// Number of migrations in the set
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// True when the set is empty
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    async fn ensure_table(&self, conn: &ConnectionHandle) -> Result<()> {
        crate::manager::introspect::validate_identifier(&self.table_name)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version BIGINT PRIMARY KEY NOT NULL,
                name VARCHAR(255) NOT NULL,
                applied_at BIGINT NOT NULL
            )",
            self.table_name
        ))
        .await
    }

    /// Versions recorded as applied, ascending
    pub async fn applied_versions(&self, conn: &ConnectionHandle) -> Result<Vec<i64>> {
        self.ensure_table(conn).await?;
        Statement::new(format!(
            "SELECT version FROM {} ORDER BY version",
            self.table_name
        ))
        .map(conn, |rows| rows.iter().map(|r| r.get_i64("version")).collect())
        .await
    }

    /// Highest applied version
    pub async fn current_version(&self, conn: &ConnectionHandle) -> Result<Option<i64>> {
        Ok(self.applied_versions(conn).await?.last().copied())
    }

    /// Status of every migration in the set
    pub async fn status(&self, conn: &ConnectionHandle) -> Result<BTreeMap<i64, MigrationStatus>> {
        let applied = self.applied_versions(conn).await?;
        Ok(self
            .migrations
            .keys()
            .map(|version| {
                let status = if applied.contains(version) {
                    MigrationStatus::Applied
                } else {
                    MigrationStatus::Pending
                };
                (*version, status)
            })
            .collect())
    }

    /// Apply pending migrations in version order, each in its own transaction
    ///
    /// Returns the versions applied by this call.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration; earlier ones stay applied. Engines
    /// that commit DDL implicitly (MySQL) may keep partial effects of the failing one.
    pub async fn apply(&self, conn: &ConnectionHandle) -> Result<Vec<i64>> {
        let applied = self.applied_versions(conn).await?;
        let mut migrated = Vec::new();

        for (version, migration) in &self.migrations {
            if applied.contains(version) {
                continue;
            }
            let record = format!(
                "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
                self.table_name
            );
            run_in_transaction(conn.clone(), |tx| async move {
                tx.execute_batch(migration.up_sql()).await?;
                Statement::new(record)
                    .bind(*version)
                    .bind(migration.name())
                    .bind(chrono::Utc::now().timestamp())
                    .execute(&tx)
                    .await
            })
            .await
            .map_err(|e| match e {
                DatabaseError::Backend { code, message } => DatabaseError::Backend {
                    code,
                    message: format!("migration {} ({}) failed: {}", version, migration.name(), message),
                },
                other => other,
            })?;

            tracing::info!(version, name = migration.name(), "applied migration");
            migrated.push(*version);
        }

        Ok(migrated)
    }
}
