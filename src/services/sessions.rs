//! Login session tokens
//!
//! Tokens are random v4 UUIDs in simple form. Timestamps are stored as epoch
//! milliseconds; a session is valid while `expires_at` lies in the future.

use crate::core::connection::{Access, TaskContext};
use crate::core::error::{DatabaseError, Result};
use crate::core::statement::Statement;
use crate::core::value::Row;
use crate::manager::introspect;
use crate::manager::ConnectionManager;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

const ISSUE_ATTEMPTS: u32 = 3;

/// One stored session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl SessionRecord {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            token: row.get_string("token")?,
            user_id: row.get_i64("user_id")?,
            created_at: row.get_i64("created_at")?,
            expires_at: row.get_i64("expires_at")?,
        })
    }

    /// Expiry as a UTC timestamp
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }

    /// True when the session has expired at `now_ms`
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Issues, validates and revokes session tokens stored in one table
pub struct SessionManager {
    manager: Arc<ConnectionManager>,
    table: String,
    ttl: Duration,
}

impl SessionManager {
    /// Sessions in `table` living `ttl` each
    ///
    /// # Errors
    ///
    /// Returns a usage error when `table` is not a plain identifier.
    pub fn new(manager: Arc<ConnectionManager>, table: impl Into<String>, ttl: Duration) -> Result<Self> {
        let table = table.into();
        introspect::validate_identifier(&table)?;
        Ok(Self { manager, table, ttl })
    }

    /// Lifetime of new sessions
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn user_index(&self) -> String {
        format!("idx_{}_user", self.table)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Create the table and its user index when missing
    pub async fn create_table(&self, ctx: &TaskContext) -> Result<()> {
        let table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                token VARCHAR(64) NOT NULL PRIMARY KEY,
                user_id BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL
            )",
            self.table
        );
        let index = self.user_index();
        self.manager
            .execute(ctx, Access::Write, |conn| async move {
                conn.execute_batch(&table).await?;
                if !introspect::index_exists(&conn, &self.table, &index).await? {
                    conn.execute_batch(&format!(
                        "CREATE INDEX {} ON {} (user_id)",
                        index, self.table
                    ))
                    .await?;
                }
                Ok(())
            })
            .await
    }

    /// Start a session for `user_id` and return it
    ///
    /// # Errors
    ///
    /// A token collision draws a new token; repeated collisions return
    /// [`DatabaseError::RetriesExhausted`].
    pub async fn issue(&self, ctx: &TaskContext, user_id: i64) -> Result<SessionRecord> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let created_at = Self::now_ms();
            let record = SessionRecord {
                token: uuid::Uuid::new_v4().simple().to_string(),
                user_id,
                created_at,
                expires_at: created_at.saturating_add(ttl_ms),
            };
            let inserted = Statement::new(format!(
                "INSERT INTO {} (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
                self.table
            ))
            .bind(record.token.as_str())
            .bind(record.user_id)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.manager.session(ctx))
            .await;

            match inserted {
                Ok(()) => {
                    tracing::debug!(table = %self.table, user_id, "issued session");
                    return Ok(record);
                }
                Err(e) if e.is_constraint_violation() && attempt < ISSUE_ATTEMPTS => {
                    tracing::warn!(table = %self.table, attempt, "session token collision, drawing another");
                }
                Err(e) if e.is_constraint_violation() => {
                    return Err(DatabaseError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// User owning `token`, if the session exists and has not expired
    ///
    /// An expired session found here is deleted.
    pub async fn validate(&self, ctx: &TaskContext, token: &str) -> Result<Option<i64>> {
        let now = Self::now_ms();
        self.manager
            .execute_transaction(ctx, |conn| async move {
                let record = Statement::new(format!(
                    "SELECT token, user_id, created_at, expires_at FROM {} WHERE token = ?",
                    self.table
                ))
                .bind(token)
                .fetch_optional(&conn)
                .await?
                .map(|row| SessionRecord::from_row(&row))
                .transpose()?;

                match record {
                    Some(record) if record.is_expired_at(now) => {
                        Statement::new(format!("DELETE FROM {} WHERE token = ?", self.table))
                            .bind(token)
                            .execute(&conn)
                            .await?;
                        tracing::debug!(table = %self.table, user_id = record.user_id, "deleted expired session");
                        Ok(None)
                    }
                    Some(record) => Ok(Some(record.user_id)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// End the session with `token`; true when it existed
    pub async fn revoke(&self, ctx: &TaskContext, token: &str) -> Result<bool> {
        let removed = Statement::new(format!("DELETE FROM {} WHERE token = ?", self.table))
            .bind(token)
            .rows_affected(&self.manager.session(ctx))
            .await?;
        Ok(removed > 0)
    }

    /// End every session of `user_id`, returning how many there were
    pub async fn revoke_user(&self, ctx: &TaskContext, user_id: i64) -> Result<u64> {
        Statement::new(format!("DELETE FROM {} WHERE user_id = ?", self.table))
            .bind(user_id)
            .rows_affected(&self.manager.session(ctx))
            .await
    }

    /// Delete expired sessions, returning how many were removed
    pub async fn purge_expired(&self, ctx: &TaskContext) -> Result<u64> {
        let purged = Statement::new(format!("DELETE FROM {} WHERE expires_at <= ?", self.table))
            .bind(Self::now_ms())
            .rows_affected(&self.manager.session(ctx))
            .await?;
        if purged > 0 {
            tracing::info!(table = %self.table, purged, "purged expired sessions");
        }
        Ok(purged)
    }

    /// Live sessions of `user_id`, newest first
    pub async fn sessions_for_user(&self, ctx: &TaskContext, user_id: i64) -> Result<Vec<SessionRecord>> {
        let hint = self.manager.dialect().index_hint(&self.user_index());
        let rows = Statement::new(format!(
            "SELECT token, user_id, created_at, expires_at FROM {} {} \
             WHERE user_id = ? AND expires_at > ? ORDER BY created_at DESC",
            self.table, hint
        ))
        .bind(user_id)
        .bind(Self::now_ms())
        .fetch_all(&self.manager.session(ctx))
        .await?;
        rows.iter().map(SessionRecord::from_row).collect()
    }
}
