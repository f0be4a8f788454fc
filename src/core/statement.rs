//! Single-use statements
//!
//! A [`Statement`] is a SQL string plus positional arguments. Every terminal method
//! consumes the statement, so running it twice does not compile:
//!
//! ```compile_fail
//! use rust_connection_manager::core::{ConnectionHandle, Statement};
//!
//! async fn twice(conn: &ConnectionHandle) {
//!     let stmt = Statement::new("DELETE FROM t WHERE id = ?").bind(1);
//!     stmt.rows_affected(conn).await.unwrap();
//!     stmt.rows_affected(conn).await.unwrap();
//! }
//! ```
//!
//! Terminal methods run against any [`Executor`]: a [`ConnectionHandle`] already
//! leased by the caller, or a manager session that leases one for the call.

use super::connection::{Access, ConnectionHandle};
use super::error::{DatabaseError, Result};
use super::value::{Row, SqlValue};
use async_trait::async_trait;

/// How the result of a statement is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Rows are collected and handed to a mapping function
    Value,
    /// The statement runs for its side effects only
    Void,
    /// The number of affected rows is returned
    RowCount,
    /// The key generated by an insert is returned
    GeneratedKey,
}

/// Result of running a [`StatementRequest`]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Collected rows
    Rows(Vec<Row>),
    /// Nothing to report
    Void,
    /// Affected row count
    RowCount(u64),
    /// Generated key
    GeneratedKey(i64),
}

/// A validated statement ready to run, consumed by [`run`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRequest {
    sql: String,
    args: Vec<SqlValue>,
    mode: ExecutionMode,
    access: Access,
}

impl StatementRequest {
    /// SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound arguments
    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    /// Execution mode
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Lease side this request needs
    pub fn access(&self) -> Access {
        self.access
    }
}

/// Run a request on an already-leased connection
pub async fn run(request: StatementRequest, conn: &ConnectionHandle) -> Result<Outcome> {
    let StatementRequest { sql, args, mode, .. } = request;
    match mode {
        ExecutionMode::Value => conn.query(&sql, &args).await.map(Outcome::Rows),
        ExecutionMode::Void => conn.execute(&sql, &args).await.map(|_| Outcome::Void),
        ExecutionMode::RowCount => conn.execute(&sql, &args).await.map(Outcome::RowCount),
        ExecutionMode::GeneratedKey => conn
            .insert(&sql, &args)
            .await?
            .map(Outcome::GeneratedKey)
            .ok_or_else(|| {
                DatabaseError::backend(None, format!("no key generated by '{}'", sql))
            }),
    }
}

/// Something a [`StatementRequest`] can run against
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one request
    async fn run(&self, request: StatementRequest) -> Result<Outcome>;
}

#[async_trait]
impl Executor for ConnectionHandle {
    async fn run(&self, request: StatementRequest) -> Result<Outcome> {
        run(request, self).await
    }
}

/// Count `?` placeholders outside quoted literals and identifiers
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match quote {
            // A doubled quote toggles out and back in, which keeps the count right
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

/// SQL text plus positional arguments
#[must_use = "a statement does nothing until one of its terminal methods is awaited"]
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    args: Vec<SqlValue>,
    access: Access,
}

impl Statement {
    /// New statement; the lease side is inferred from the leading verb
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let access = Access::infer(&sql);
        Self {
            sql,
            args: Vec::new(),
            access,
        }
    }

    /// Bind the next positional argument
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Bind several positional arguments in order
    pub fn bind_all<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Override the inferred lease side
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Arguments bound so far
    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    /// Lease side this statement will request
    pub fn access(&self) -> Access {
        self.access
    }

    /// Validate argument arity and freeze the statement into a request
    ///
    /// # Errors
    ///
    /// Returns a usage error when the number of bound arguments differs from the
    /// number of placeholders.
    pub fn into_request(self, mode: ExecutionMode) -> Result<StatementRequest> {
        let expected = count_placeholders(&self.sql);
        if expected != self.args.len() {
            return Err(DatabaseError::usage(format!(
                "statement expects {} argument(s) but {} were bound: {}",
                expected,
                self.args.len(),
                self.sql
            )));
        }
        Ok(StatementRequest {
            sql: self.sql,
            args: self.args,
            mode,
            access: self.access,
        })
    }

    async fn dispatch<E>(self, executor: &E, mode: ExecutionMode) -> Result<Outcome>
    where
        E: Executor + ?Sized,
    {
        let request = self.into_request(mode)?;
        executor.run(request).await
    }

    /// Run for side effects
    pub async fn execute<E: Executor + ?Sized>(self, executor: &E) -> Result<()> {
        match self.dispatch(executor, ExecutionMode::Void).await? {
            Outcome::Void => Ok(()),
            other => Err(unexpected(ExecutionMode::Void, &other)),
        }
    }

    /// Run and return the number of affected rows
    pub async fn rows_affected<E: Executor + ?Sized>(self, executor: &E) -> Result<u64> {
        match self.dispatch(executor, ExecutionMode::RowCount).await? {
            Outcome::RowCount(count) => Ok(count),
            other => Err(unexpected(ExecutionMode::RowCount, &other)),
        }
    }

    /// Run an insert and return the generated key
    pub async fn generated_key<E: Executor + ?Sized>(self, executor: &E) -> Result<i64> {
        match self.dispatch(executor, ExecutionMode::GeneratedKey).await? {
            Outcome::GeneratedKey(key) => Ok(key),
            other => Err(unexpected(ExecutionMode::GeneratedKey, &other)),
        }
    }

    /// Run a query and collect every row
    pub async fn fetch_all<E: Executor + ?Sized>(self, executor: &E) -> Result<Vec<Row>> {
        match self.dispatch(executor, ExecutionMode::Value).await? {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(unexpected(ExecutionMode::Value, &other)),
        }
    }

    /// Run a query and return its first row, if any
    pub async fn fetch_optional<E: Executor + ?Sized>(self, executor: &E) -> Result<Option<Row>> {
        Ok(self.fetch_all(executor).await?.into_iter().next())
    }

    /// Run a query and map the collected rows into a value
    pub async fn map<E, T, F>(self, executor: &E, f: F) -> Result<T>
    where
        E: Executor + ?Sized,
        F: FnOnce(Vec<Row>) -> Result<T>,
    {
        let rows = self.fetch_all(executor).await?;
        f(rows)
    }
}

fn unexpected(mode: ExecutionMode, outcome: &Outcome) -> DatabaseError {
    DatabaseError::state(format!(
        "executor returned {:?} for a {:?} request",
        outcome, mode
    ))
}
