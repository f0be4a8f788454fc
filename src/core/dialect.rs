//! Dialect adapter
//!
//! Pure, stateless translation of backend specifics: error-code classification and
//! the few DDL/DML fragments that differ between the embedded and networked engines.

use super::error::DatabaseError;
use super::value::SqlValue;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// SQLite extended result codes
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_CONSTRAINT_PRIMARYKEY: i64 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i64 = 2067;

// MySQL / MariaDB server error codes
const ER_DUP_KEY: i64 = 1022;
const ER_DUP_ENTRY: i64 = 1062;
const ER_DUP_UNIQUE: i64 = 1169;
const ER_DUP_ENTRY_WITH_KEY_NAME: i64 = 1586;
const ER_LOCK_WAIT_TIMEOUT: i64 = 1205;
const ER_LOCK_DEADLOCK: i64 = 1213;

/// SQL dialect spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Embedded single-file engine
    Sqlite,
    /// MySQL server
    Mysql,
    /// MariaDB server (MySQL wire and error codes)
    MariaDb,
}

impl Dialect {
    /// Convert dialect to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
            Dialect::MariaDb => "mariadb",
        }
    }

    /// MySQL and MariaDB share error codes, catalog and DDL syntax
    pub fn is_mysql_like(&self) -> bool {
        matches!(self, Dialect::Mysql | Dialect::MariaDb)
    }

    /// True when `code` is a unique or primary key violation
    pub fn is_constraint_violation_code(&self, code: i64) -> bool {
        match self {
            Dialect::Sqlite => matches!(code, SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY),
            Dialect::Mysql | Dialect::MariaDb => matches!(
                code,
                ER_DUP_KEY | ER_DUP_ENTRY | ER_DUP_UNIQUE | ER_DUP_ENTRY_WITH_KEY_NAME
            ),
        }
    }

    /// True when `code` reports a deadlock or an expired lock wait
    pub fn is_deadlock_code(&self, code: i64) -> bool {
        match self {
            // Extended codes carry the primary code in the low byte
            Dialect::Sqlite => matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
            Dialect::Mysql | Dialect::MariaDb => {
                matches!(code, ER_LOCK_DEADLOCK | ER_LOCK_WAIT_TIMEOUT)
            }
        }
    }

    /// Turn a backend error code into the matching error category
    pub fn classify(&self, code: i64, message: impl Into<String>) -> DatabaseError {
        let message = message.into();
        if self.is_constraint_violation_code(code) {
            DatabaseError::ConstraintViolation { code, message }
        } else if self.is_deadlock_code(code) {
            DatabaseError::Deadlock { code, message }
        } else {
            DatabaseError::backend(Some(code), message)
        }
    }

    /// Column definition for an auto-assigned integer surrogate key
    pub fn auto_increment_primary_key(&self, column: &str) -> String {
        match self {
            Dialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", column),
            Dialect::Mysql | Dialect::MariaDb => {
                format!("{} INTEGER NOT NULL AUTO_INCREMENT PRIMARY KEY", column)
            }
        }
    }

    /// Table suffix forcing the planner onto `index`
    pub fn index_hint(&self, index: &str) -> String {
        match self {
            Dialect::Sqlite => format!("INDEXED BY {}", index),
            Dialect::Mysql | Dialect::MariaDb => format!("FORCE INDEX ({})", index),
        }
    }

    /// Column type for binary payloads
    pub fn blob_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Mysql | Dialect::MariaDb => "LONGBLOB",
        }
    }

    /// Read a blob column; MySQL-like drivers may hand binary columns back as text
    pub fn read_blob(&self, value: &SqlValue) -> Option<Vec<u8>> {
        match (self, value) {
            (_, SqlValue::Bytes(bytes)) => Some(bytes.clone()),
            (Dialect::Mysql | Dialect::MariaDb, SqlValue::Text(text)) => {
                Some(text.clone().into_bytes())
            }
            _ => None,
        }
    }

    /// Statement renaming a table
    pub fn rename_table(&self, from: &str, to: &str) -> String {
        match self {
            Dialect::Sqlite => format!("ALTER TABLE {} RENAME TO {}", from, to),
            Dialect::Mysql | Dialect::MariaDb => format!("RENAME TABLE {} TO {}", from, to),
        }
    }

    /// Statement opening an explicit transaction
    ///
    /// SQLite takes the write lock up front so two writers cannot both hold a
    /// shared lock and then fail to upgrade.
    pub fn begin_transaction(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Mysql | Dialect::MariaDb => "START TRANSACTION",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "mysql" => Ok(Dialect::Mysql),
            "mariadb" => Ok(Dialect::MariaDb),
            _ => Err(format!("Invalid dialect: '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("sqlite3".parse::<Dialect>().ok(), Some(Dialect::Sqlite));
        assert_eq!("MySQL".parse::<Dialect>().ok(), Some(Dialect::Mysql));
        assert_eq!("mariadb".parse::<Dialect>().ok(), Some(Dialect::MariaDb));
        assert_eq!("postgres".parse::<Dialect>().ok(), None);
    }

    #[test]
    fn test_constraint_classification() {
        assert!(Dialect::Mysql.classify(1062, "Duplicate entry").is_constraint_violation());
        assert!(Dialect::MariaDb.classify(1062, "Duplicate entry").is_constraint_violation());
        assert!(Dialect::Sqlite
            .classify(2067, "UNIQUE constraint failed")
            .is_constraint_violation());

        // NOT NULL is a constraint failure but not an "already exists" signal
        assert!(!Dialect::Sqlite.classify(1299, "NOT NULL").is_constraint_violation());
        assert!(!Dialect::Mysql.classify(1146, "no such table").is_constraint_violation());
    }

    #[test]
    fn test_deadlock_classification() {
        assert!(Dialect::Mysql.classify(1213, "Deadlock found").is_deadlock());
        assert!(Dialect::Mysql.classify(1205, "Lock wait timeout").is_deadlock());
        assert!(Dialect::Sqlite.classify(5, "database is locked").is_deadlock());
        // SQLITE_BUSY_SNAPSHOT = 5 | (2 << 8)
        assert!(Dialect::Sqlite.classify(517, "busy snapshot").is_deadlock());
        assert!(!Dialect::Sqlite.classify(1, "syntax error").is_deadlock());
    }

    #[test]
    fn test_ddl_fragments() {
        assert_eq!(
            Dialect::Sqlite.auto_increment_primary_key("id"),
            "id INTEGER PRIMARY KEY AUTOINCREMENT"
        );
        assert!(Dialect::Mysql
            .auto_increment_primary_key("id")
            .contains("AUTO_INCREMENT"));
        assert_eq!(Dialect::Sqlite.index_hint("idx_a"), "INDEXED BY idx_a");
        assert_eq!(Dialect::Mysql.index_hint("idx_a"), "FORCE INDEX (idx_a)");
        assert_eq!(Dialect::Mysql.rename_table("a", "b"), "RENAME TABLE a TO b");
    }

    #[test]
    fn test_read_blob() {
        let text = SqlValue::Text("abc".into());
        assert_eq!(Dialect::Mysql.read_blob(&text), Some(b"abc".to_vec()));
        assert_eq!(Dialect::Sqlite.read_blob(&text), None);
        assert_eq!(
            Dialect::Sqlite.read_blob(&SqlValue::Bytes(vec![1, 2])),
            Some(vec![1, 2])
        );
    }
}
