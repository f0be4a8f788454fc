//! Catalog queries against an already-leased connection
//!
//! Each helper is one read-only query against the engine's metadata: `sqlite_master`
//! and the table-valued pragmas for SQLite, `information_schema` scoped to the
//! current database for MySQL. Table and index names are checked against
//! `[A-Za-z_][A-Za-z0-9_]*` before they reach any SQL text.

use crate::core::connection::ConnectionHandle;
use crate::core::error::{DatabaseError, Result};
use crate::core::statement::Statement;
use crate::core::value::Row;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Reject anything that is not a plain identifier
///
/// # Errors
///
/// Returns [`DatabaseError::Usage`] for empty names or names with characters
/// outside `[A-Za-z0-9_]`, or a leading digit.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(DatabaseError::usage(format!("invalid identifier '{}'", name)))
    }
}

fn first_count(rows: Vec<Row>) -> Result<i64> {
    match rows.first() {
        Some(row) => row.get_i64("n"),
        None => Ok(0),
    }
}

async fn count(conn: &ConnectionHandle, sql: &str, args: &[&str]) -> Result<i64> {
    Statement::new(sql)
        .bind_all(args.iter().copied())
        .map(conn, first_count)
        .await
}

/// True when `table` exists
pub async fn table_exists(conn: &ConnectionHandle, table: &str) -> Result<bool> {
    let table = validate_identifier(table)?;
    let sql = if conn.dialect().is_mysql_like() {
        "SELECT COUNT(*) AS n FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
    } else {
        "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?"
    };
    Ok(count(conn, sql, &[table]).await? > 0)
}

/// True when `table` has a column named `column` (case-insensitive)
pub async fn column_exists(conn: &ConnectionHandle, table: &str, column: &str) -> Result<bool> {
    let table = validate_identifier(table)?;
    let sql = if conn.dialect().is_mysql_like() {
        "SELECT COUNT(*) AS n FROM information_schema.COLUMNS \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?"
    } else {
        "SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE lower(name) = lower(?)"
    };
    Ok(count(conn, sql, &[table, column]).await? > 0)
}

/// True when `table` has an index named `index`
pub async fn index_exists(conn: &ConnectionHandle, table: &str, index: &str) -> Result<bool> {
    let table = validate_identifier(table)?;
    let index = validate_identifier(index)?;
    let sql = if conn.dialect().is_mysql_like() {
        "SELECT COUNT(*) AS n FROM information_schema.STATISTICS \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = ?"
    } else {
        "SELECT COUNT(*) AS n FROM sqlite_master \
         WHERE type = 'index' AND tbl_name = ? AND name = ?"
    };
    Ok(count(conn, sql, &[table, index]).await? > 0)
}

/// True when `table` has a primary key
pub async fn primary_key_exists(conn: &ConnectionHandle, table: &str) -> Result<bool> {
    let table = validate_identifier(table)?;
    let sql = if conn.dialect().is_mysql_like() {
        "SELECT COUNT(*) AS n FROM information_schema.STATISTICS \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = 'PRIMARY'"
    } else {
        "SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE pk > 0"
    };
    Ok(count(conn, sql, &[table]).await? > 0)
}

/// Unique indexes of `table` with their columns in index order
async fn unique_indexes(conn: &ConnectionHandle, table: &str) -> Result<Vec<Vec<String>>> {
    let mut indexes: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if conn.dialect().is_mysql_like() {
        let rows = Statement::new(
            "SELECT INDEX_NAME AS index_name, COLUMN_NAME AS column_name \
             FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND NON_UNIQUE = 0 \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(table)
        .fetch_all(conn)
        .await?;
        for row in rows {
            indexes
                .entry(row.get_string("index_name")?)
                .or_default()
                .push(row.get_string("column_name")?);
        }
    } else {
        let names = Statement::new("SELECT name FROM pragma_index_list(?) WHERE \"unique\" = 1")
            .bind(table)
            .fetch_all(conn)
            .await?;
        for row in names {
            let name = row.get_string("name")?;
            let columns = Statement::new("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                .bind(name.as_str())
                .fetch_all(conn)
                .await?
                .iter()
                .map(|r| r.get_string("name"))
                .collect::<Result<Vec<_>>>()?;
            indexes.insert(name, columns);
        }
    }

    Ok(indexes.into_values().collect())
}

/// True when a unique index or constraint on `table` covers exactly `columns`
///
/// Column order is ignored and names compare case-insensitively.
pub async fn unique_constraint_exists(
    conn: &ConnectionHandle,
    table: &str,
    columns: &[&str],
) -> Result<bool> {
    let table = validate_identifier(table)?;
    let mut wanted: Vec<String> = columns.iter().map(|c| c.to_ascii_lowercase()).collect();
    wanted.sort();

    Ok(unique_indexes(conn, table).await?.into_iter().any(|index| {
        let mut have: Vec<String> = index.iter().map(|c| c.to_ascii_lowercase()).collect();
        have.sort();
        have == wanted
    }))
}

/// Number of rows in `table`
pub async fn row_count(conn: &ConnectionHandle, table: &str) -> Result<i64> {
    let table = validate_identifier(table)?;
    count(conn, &format!("SELECT COUNT(*) AS n FROM {}", table), &[]).await
}

/// SHA-256 (hex) over every table, column, type and nullability, in catalog order
///
/// Names and types are lower-cased so the hash only changes when the shape of
/// the schema does.
pub async fn schema_hash(conn: &ConnectionHandle) -> Result<String> {
    let mysql = conn.dialect().is_mysql_like();
    let sql = if mysql {
        "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, \
                DATA_TYPE AS column_type, IS_NULLABLE AS nullable \
         FROM information_schema.COLUMNS WHERE TABLE_SCHEMA = DATABASE() \
         ORDER BY TABLE_NAME, ORDINAL_POSITION"
    } else {
        "SELECT m.name AS table_name, p.name AS column_name, \
                p.type AS column_type, p.\"notnull\" AS not_null \
         FROM sqlite_master AS m, pragma_table_info(m.name) AS p \
         WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
         ORDER BY m.name, p.cid"
    };
    let rows = Statement::new(sql).fetch_all(conn).await?;

    let mut hasher = Sha256::new();
    for row in &rows {
        let nullable = if mysql {
            row.get_string("nullable")?.eq_ignore_ascii_case("yes")
        } else {
            row.get_i64("not_null")? == 0
        };
        let line = format!(
            "{}|{}|{}|{}\n",
            row.get_string("table_name")?.to_ascii_lowercase(),
            row.get_string("column_name")?.to_ascii_lowercase(),
            row.get_string("column_type")?.to_ascii_lowercase(),
            u8::from(nullable)
        );
        hasher.update(line.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}
