//! SQLite backend
//!
//! Wraps one `rusqlite` connection. Every call is offloaded to the blocking thread
//! pool; the connection itself sits behind a mutex so the nested calls of one task
//! can share it through cloned handles.

use crate::core::{
    config::SqliteConfig,
    connection::{Connection, ConnectionFactory},
    dialect::Dialect,
    error::{DatabaseError, Result},
    value::{Row, SqlValue},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, ToSql};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlValue::Int(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            SqlValue::Double(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Int(v),
            ValueRef::Real(v) => SqlValue::Double(v),
            ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => SqlValue::Bytes(v.to_vec()),
        }
    }
}

fn collect_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(SqlValue::from(row.get_ref(idx)?));
        }
        results.push(Row::new(Arc::clone(&columns), values));
    }
    Ok(results)
}

/// One physical SQLite connection
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    in_transaction: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl SqliteConnection {
    /// Open the database file, creating parent directories when absent
    ///
    /// Blocking; pools call this through [`SqliteConnectionFactory`].
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directories cannot be created, or a backend
    /// error if the file cannot be opened or configured.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = rusqlite::Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        if config.foreign_keys {
            conn.execute("PRAGMA foreign_keys = ON", [])?;
        }
        if config.journal_mode_wal {
            // PRAGMA journal_mode returns a value, so it has to go through query_row
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            in_transaction: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a private in-memory database (tests and scratch work)
    ///
    /// # Errors
    ///
    /// Returns a backend error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            in_transaction: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `f` on the blocking pool with the driver connection locked
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::state("connection is closed"));
        }
        let conn = Arc::clone(&self.conn);
        let in_transaction = Arc::clone(&self.in_transaction);

        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let result = f(&guard);
            in_transaction.store(!guard.is_autocommit(), Ordering::Release);
            result
        })
        .await
        .map_err(|e| DatabaseError::backend(None, format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let affected = stmt.execute(params_from_iter(params.iter()))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn insert(&self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let affected = stmt.execute(params_from_iter(params.iter()))?;
            Ok((affected > 0).then(|| conn.last_insert_rowid()))
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| collect_rows(conn, &sql, &params))
            .await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }

    async fn begin(&self) -> Result<()> {
        self.with_conn(|conn| {
            if !conn.is_autocommit() {
                return Err(DatabaseError::state("transaction already open"));
            }
            conn.execute_batch(Dialect::Sqlite.begin_transaction())?;
            Ok(())
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
            .await
    }

    async fn rollback(&self) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))
            .await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    async fn is_alive(&self) -> bool {
        self.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |_| Ok(()))?))
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        // The driver connection is closed when the last handle drops it
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Opens [`SqliteConnection`]s on one database file
#[derive(Debug, Clone)]
pub struct SqliteConnectionFactory {
    config: SqliteConfig,
}

impl SqliteConnectionFactory {
    /// Factory for the file described by `config`
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let config = self.config.clone();
        let conn = tokio::task::spawn_blocking(move || SqliteConnection::open(&config))
            .await
            .map_err(|e| DatabaseError::backend(None, format!("Task join error: {}", e)))?
            .map_err(|e| match e {
                DatabaseError::Io(_) => e,
                other => DatabaseError::connection_failed(self.describe(), other.to_string()),
            })?;
        Ok(Box::new(conn))
    }

    fn describe(&self) -> String {
        self.config.path.display().to_string()
    }
}
