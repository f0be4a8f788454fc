//! Backend implementations
//!
//! Each backend provides a [`Connection`](crate::core::Connection) and the
//! [`ConnectionFactory`](crate::core::ConnectionFactory) that opens it.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqliteConnectionFactory};

#[cfg(feature = "mysql")]
pub use mysql::{MysqlConnection, MysqlConnectionFactory};
