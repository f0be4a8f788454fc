//! # Rust Connection Manager
//!
//! Transactional connection management for an embedded SQL engine (SQLite) and a
//! networked one (MySQL/MariaDB). Callers never talk to a driver directly; they ask
//! the [`ConnectionManager`] to run a closure with a leased connection and get a
//! typed [`Result`] back.
//!
//! ## Features
//!
//! - **Bounded waits**: every acquisition has a deadline and fails with
//!   [`DatabaseError::Busy`] instead of blocking forever
//! - **Read/write discipline**: the single-connection pool lets readers share and
//!   gives writers exclusive access
//! - **Task affinity**: nested calls made with the same [`TaskContext`] reuse the
//!   connection (and transaction) already held
//! - **Dialect-aware errors**: unique-key violations and deadlocks are classified
//!   per backend, so retry decisions are typed
//! - **Usage ratios**: pool utilization over the trailing 5 minutes, 1 minute and
//!   5 seconds
//! - **Services**: value interning, typed settings and session tokens built on top
//!
//! ## Supported Databases
//!
//! | Database | Feature | Pool |
//! |----------|---------|------|
//! | SQLite | `sqlite` (default) | one shared connection, read/write lock |
//! | MySQL / MariaDB | `mysql` | bounded set of leased connections |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_connection_manager::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = ConnectionManager::sqlite(
//!         SqliteConfig::new("data/app.db"),
//!         ManagerConfig::default(),
//!     );
//!
//!     let ctx = TaskContext::new();
//!     manager
//!         .init(&ctx, |conn| async move {
//!             conn.execute_batch("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)")
//!                 .await
//!         })
//!         .await?;
//!
//!     let session = manager.session(&ctx);
//!     let id = Statement::new("INSERT INTO users (name) VALUES (?)")
//!         .bind("Alice")
//!         .generated_key(&session)
//!         .await?;
//!
//!     let name = Statement::new("SELECT name FROM users WHERE id = ?")
//!         .bind(id)
//!         .fetch_optional(&session)
//!         .await?;
//!     println!("{:?}", name);
//!
//!     manager.close().await
//! }
//! ```
//!
//! ### Working with Transactions
//!
//! ```rust,no_run
//! use rust_connection_manager::prelude::*;
//!
//! # async fn transfer(manager: &ConnectionManager) -> Result<()> {
//! let ctx = TaskContext::new();
//! manager
//!     .execute_transaction(&ctx, |conn| async move {
//!         Statement::new("UPDATE accounts SET balance = balance - 10 WHERE id = ?")
//!             .bind(1)
//!             .execute(&conn)
//!             .await?;
//!         Statement::new("UPDATE accounts SET balance = balance + 10 WHERE id = ?")
//!             .bind(2)
//!             .execute(&conn)
//!             .await
//!     })
//!     .await
//! # }
//! ```
//!
//! ## Project Structure
//!
//! ```text
//! src/
//! ├── core/        # errors, values, connections, dialects, statements, migrations
//! ├── pool/        # single-connection and leased pools, usage tracking
//! ├── backends/    # SQLite and MySQL drivers
//! ├── manager/     # ConnectionManager facade and catalog introspection
//! └── services/    # interning, settings, sessions, caches
//! ```

/// Core types and traits
pub mod core;

/// Connection pools
pub mod pool;

/// Backend implementations
pub mod backends;

/// Connection manager facade
pub mod manager;

/// Services built on the manager
pub mod services;

/// Prelude for convenient imports
///
/// ```rust
/// use rust_connection_manager::prelude::*;
///
/// let access = Access::infer("SELECT 1");
/// assert_eq!(access, Access::Read);
/// ```
pub mod prelude {
    pub use crate::core::{
        Access, BusyReason, ConnectionHandle, DatabaseError, Dialect, ManagerConfig, MysqlConfig,
        Result, Row, SqlValue, SqliteConfig, Statement, TaskContext,
    };
    pub use crate::manager::{ConnectionManager, ManagerState, Session};
    pub use crate::pool::{ConnectionPool, PoolState, PoolStats, UsageRatios};
}

// Re-export at root level for convenience
pub use crate::core::{Access, DatabaseError, Result, Statement, TaskContext};
pub use crate::manager::ConnectionManager;
