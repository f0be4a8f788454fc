//! Typed per-user settings
//!
//! Values are stored JSON-encoded, one row per `(user_id, name)`. A [`Setting`]
//! names a key and carries the default returned while nothing is stored.

use super::cache::ExpiringCache;
use crate::core::connection::{Access, TaskContext};
use crate::core::error::Result;
use crate::core::statement::Statement;
use crate::manager::introspect;
use crate::manager::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Typed settings key with its default
#[derive(Debug, Clone)]
pub struct Setting<T> {
    name: &'static str,
    default: T,
}

impl<T> Setting<T> {
    /// Key `name` falling back to `default`
    pub const fn new(name: &'static str, default: T) -> Self {
        Self { name, default }
    }

    /// Key name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Value used while nothing is stored
    pub fn default_value(&self) -> &T {
        &self.default
    }
}

/// Reads and writes settings stored in one table
pub struct SettingsManager {
    manager: Arc<ConnectionManager>,
    table: String,
    cache: ExpiringCache<(i64, String), String>,
}

impl SettingsManager {
    /// Settings stored in `table`
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
            cache: ExpiringCache::new(4_096, Duration::from_secs(300)),
        })
    }

    /// Create the table when missing
    pub async fn create_table(&self, ctx: &TaskContext) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                user_id BIGINT NOT NULL,
                name VARCHAR(128) NOT NULL,
                value TEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (user_id, name)
            )",
            self.table
        );
        self.manager
            .execute(ctx, Access::Write, |conn| async move { conn.execute_batch(&sql).await })
            .await
    }

    async fn raw(&self, ctx: &TaskContext, user_id: i64, name: &str) -> Result<Option<String>> {
        let key = (user_id, name.to_string());
        if let Some(raw) = self.cache.get(&key) {
            return Ok(Some(raw));
        }
        let table = self.table.as_str();
        let (raw, committed) = self
            .manager
            .execute(ctx, Access::Read, |conn| async move {
                let raw = Statement::new(format!(
                    "SELECT value FROM {} WHERE user_id = ? AND name = ?",
                    table
                ))
                .bind(user_id)
                .bind(name)
                .fetch_optional(&conn)
                .await?
                .map(|row| row.get_string("value"))
                .transpose()?;
                Ok((raw, !conn.in_transaction()))
            })
            .await?;
        // Values read inside an open transaction may still be rolled back
        if let (Some(raw), true) = (&raw, committed) {
            self.cache.put(key, raw.clone());
        }
        Ok(raw)
    }

    /// Stored value of `setting` for `user_id`, or its default
    ///
    /// # Errors
    ///
    /// Returns a serialization error when the stored JSON does not decode as `T`.
    pub async fn get<T>(&self, ctx: &TaskContext, user_id: i64, setting: &Setting<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        match self.raw(ctx, user_id, setting.name).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(setting.default.clone()),
        }
    }

    /// Store `value` for `user_id`
    ///
    /// Inserts first; a constraint violation means the row already exists and
    /// turns into an update within the same transaction. The cache is only
    /// refreshed when this call committed; inside an enclosing transaction the
    /// cached entry is dropped instead.
    pub async fn set<T>(
        &self,
        ctx: &TaskContext,
        user_id: i64,
        setting: &Setting<T>,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let raw = serde_json::to_string(value)?;
        let now = chrono::Utc::now().timestamp_millis();
        let name = setting.name;
        let table = self.table.as_str();
        let stored = raw.clone();

        let ((), committed) = self
            .manager
            .execute_transaction_committed(ctx, |conn| async move {
                let inserted = Statement::new(format!(
                    "INSERT INTO {} (user_id, name, value, updated_at) VALUES (?, ?, ?, ?)",
                    table
                ))
                .bind(user_id)
                .bind(name)
                .bind(stored.as_str())
                .bind(now)
                .execute(&conn)
                .await;
                match inserted {
                    Err(e) if e.is_constraint_violation() => {
                        Statement::new(format!(
                            "UPDATE {} SET value = ?, updated_at = ? WHERE user_id = ? AND name = ?",
                            table
                        ))
                        .bind(stored)
                        .bind(now)
                        .bind(user_id)
                        .bind(name)
                        .execute(&conn)
                        .await
                    }
                    other => other,
                }
            })
            .await?;

        let key = (user_id, name.to_string());
        if committed {
            self.cache.put(key, raw);
        } else {
            // The enclosing transaction decides; until then storage is the truth
            self.cache.invalidate(&key);
        }
        Ok(())
    }

    /// Delete the stored value of `name`; true when a row was removed
    pub async fn remove(&self, ctx: &TaskContext, user_id: i64, name: &str) -> Result<bool> {
        self.cache.invalidate(&(user_id, name.to_string()));
        let removed = Statement::new(format!(
            "DELETE FROM {} WHERE user_id = ? AND name = ?",
            self.table
        ))
        .bind(user_id)
        .bind(name)
        .rows_affected(&self.manager.session(ctx))
        .await?;
        Ok(removed > 0)
    }

    /// Every stored setting of `user_id`, decoded as JSON
    pub async fn all_for_user(
        &self,
        ctx: &TaskContext,
        user_id: i64,
    ) -> Result<BTreeMap<String, serde_json::Value>> {
        let rows = Statement::new(format!(
            "SELECT name, value FROM {} WHERE user_id = ? ORDER BY name",
            self.table
        ))
        .bind(user_id)
        .fetch_all(&self.manager.session(ctx))
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, serde_json::Value)> {
                let value = serde_json::from_str(&row.get_string("value")?)?;
                Ok((row.get_string("name")?, value))
            })
            .collect()
    }
}
