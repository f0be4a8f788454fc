//! Explicit transactions on a leased connection
//!
//! [`run_in_transaction`] disables auto-commit, runs the body and commits on
//! success. On any failure it rolls back (which restores auto-commit) and returns
//! the body's error unchanged. When the connection is already inside a transaction
//! the body simply joins it: the outermost caller owns commit and rollback, so a
//! failure raised by a nested body unwinds the whole transaction.

use super::connection::ConnectionHandle;
use super::error::Result;
use std::future::Future;

/// Run `body` inside a transaction on `conn`
///
/// # Errors
///
/// Returns the error raised by `body`, or the commit error if committing fails.
/// A failed rollback is logged and never replaces the original error.
pub async fn run_in_transaction<T, F, Fut>(conn: ConnectionHandle, body: F) -> Result<T>
where
    F: FnOnce(ConnectionHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if conn.in_transaction() {
        tracing::debug!(connection = conn.id(), "joining enclosing transaction");
        return body(conn).await;
    }

    conn.begin().await?;
    match body(conn.clone()).await {
        Ok(value) => match conn.commit().await {
            Ok(()) => Ok(value),
            Err(e) => {
                tracing::warn!(connection = conn.id(), error = %e, "commit failed");
                rollback_quietly(&conn).await;
                Err(e)
            }
        },
        Err(e) => {
            tracing::debug!(connection = conn.id(), error = %e, "rolling back transaction");
            rollback_quietly(&conn).await;
            Err(e)
        }
    }
}

async fn rollback_quietly(conn: &ConnectionHandle) {
    if !conn.in_transaction() {
        return;
    }
    if let Err(e) = conn.rollback().await {
        tracing::error!(
            connection = conn.id(),
            error = %e,
            "rollback failed, connection may still be mid-transaction"
        );
    }
}
