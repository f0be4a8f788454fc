//! Core types and traits
//!
//! Errors, values, the connection abstraction, dialect rules, configuration,
//! single-use statements, transactions and schema migrations. Nothing in here
//! knows about pooling.

pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod migration;
pub mod statement;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use config::{LeasedPoolConfig, ManagerConfig, MysqlConfig, SqliteConfig};
pub use connection::{Access, Connection, ConnectionFactory, ConnectionHandle, TaskContext, TaskId};
pub use dialect::Dialect;
pub use error::{BusyReason, DatabaseError, ErrorKind, Result};
pub use migration::{Migration, MigrationStatus, Migrations};
pub use statement::{ExecutionMode, Executor, Outcome, Statement, StatementRequest};
pub use transaction::run_in_transaction;
pub use value::{Row, SqlValue};
