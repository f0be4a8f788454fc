//! MySQL / MariaDB backend
//!
//! One `mysql_async` connection per [`MysqlConnection`]. Statements are sent
//! through the binary protocol with positional `?` arguments; errors reported by
//! the server are classified by the dialect adapter on conversion.

use crate::core::{
    config::MysqlConfig,
    connection::{Connection, ConnectionFactory},
    dialect::Dialect,
    error::{DatabaseError, Result},
    value::{Row, SqlValue},
};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn to_mysql(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(v) => Value::Int(i64::from(*v)),
        SqlValue::Int(v) => Value::Int(*v),
        SqlValue::Double(v) => Value::Double(*v),
        SqlValue::Text(v) => Value::Bytes(v.as_bytes().to_vec()),
        SqlValue::Bytes(v) => Value::Bytes(v.clone()),
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::NULL => SqlValue::Null,
            Value::Int(v) => SqlValue::Int(v),
            Value::UInt(v) => i64::try_from(v)
                .map(SqlValue::Int)
                .unwrap_or_else(|_| SqlValue::Text(v.to_string())),
            Value::Float(v) => SqlValue::Double(f64::from(v)),
            Value::Double(v) => SqlValue::Double(v),
            Value::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => SqlValue::Text(text),
                Err(e) => SqlValue::Bytes(e.into_bytes()),
            },
            other => SqlValue::Text(other.as_sql(true).trim_matches('\'').to_string()),
        }
    }
}

fn params(values: &[SqlValue]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(to_mysql).collect())
    }
}

fn convert_row(mut row: mysql_async::Row, columns: &Arc<[String]>) -> Row {
    let values = (0..columns.len())
        .map(|idx| {
            row.take::<Value, _>(idx)
                .map(SqlValue::from)
                .unwrap_or(SqlValue::Null)
        })
        .collect();
    Row::new(Arc::clone(columns), values)
}

/// One physical MySQL connection
pub struct MysqlConnection {
    conn: Mutex<Option<Conn>>,
    in_transaction: AtomicBool,
    dialect: Dialect,
}

impl MysqlConnection {
    /// Connect using `config`, failing after `connect_timeout_ms`
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ConnectionFailed`] when the server cannot be
    /// reached or rejects the credentials.
    pub async fn connect(config: &MysqlConfig) -> Result<Self> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .db_name(Some(config.database.clone()))
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .into();

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let conn = match tokio::time::timeout(timeout, Conn::new(opts)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(DatabaseError::connection_failed(config.target(), e.to_string())),
            Err(_) => {
                return Err(DatabaseError::connection_failed(
                    config.target(),
                    format!("timed out after {}ms", config.connect_timeout_ms),
                ))
            }
        };

        let dialect = if conn.server_version().0 >= 10 {
            Dialect::MariaDb
        } else {
            Dialect::Mysql
        };

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            in_transaction: AtomicBool::new(false),
            dialect,
        })
    }
}

fn closed() -> DatabaseError {
    DatabaseError::state("connection is closed")
}

#[async_trait]
impl Connection for MysqlConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.exec_drop(sql, params(args)).await?;
        Ok(conn.affected_rows())
    }

    async fn insert(&self, sql: &str, args: &[SqlValue]) -> Result<Option<i64>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.exec_drop(sql, params(args)).await?;
        if conn.affected_rows() == 0 {
            return Ok(None);
        }
        Ok(conn.last_insert_id().and_then(|id| i64::try_from(id).ok()))
    }

    async fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let rows: Vec<mysql_async::Row> = conn.exec(sql, params(args)).await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        Ok(rows.into_iter().map(|row| convert_row(row, &columns)).collect())
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.query_drop(sql).await?;
        Ok(())
    }

    async fn begin(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(DatabaseError::state("transaction already open"));
        }
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.query_drop(self.dialect.begin_transaction()).await?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.query_drop("COMMIT").await?;
        self.in_transaction.store(false, Ordering::Release);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let result = conn.query_drop("ROLLBACK").await;
        // The server ends the transaction even when it reports an error here
        self.in_transaction.store(false, Ordering::Release);
        result.map_err(DatabaseError::from)
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    async fn is_alive(&self) -> bool {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

/// Opens [`MysqlConnection`]s for a leased pool
#[derive(Debug, Clone)]
pub struct MysqlConnectionFactory {
    config: MysqlConfig,
}

impl MysqlConnectionFactory {
    /// Factory for the server described by `config`
    pub fn new(config: MysqlConfig) -> Self {
        Self { config }
    }

    /// Connection parameters
    pub fn config(&self) -> &MysqlConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for MysqlConnectionFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MysqlConnection::connect(&self.config).await?))
    }

    fn describe(&self) -> String {
        self.config.target()
    }
}
