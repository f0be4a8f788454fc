//! Construction parameters for backends, pools and the connection manager
//!
//! All configuration types derive `Serialize`/`Deserialize` so an embedding
//! application can keep them in its own config file; missing fields fall back to
//! the defaults below.

use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default wait for a lease (10 seconds)
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 10_000;

/// Embedded engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file; parent directories are created when absent
    pub path: PathBuf,
    /// How long the engine itself waits on a locked file before reporting busy
    pub busy_timeout_ms: u64,
    /// Switch the file to write-ahead logging on open
    pub journal_mode_wal: bool,
    /// Enforce foreign keys
    pub foreign_keys: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("database.db"),
            busy_timeout_ms: 5_000,
            journal_mode_wal: true,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Configuration for the database file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the engine busy timeout
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable write-ahead logging
    pub fn with_wal(mut self, enabled: bool) -> Self {
        self.journal_mode_wal = enabled;
        self
    }

    /// Engine busy timeout as a duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Networked engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Schema to use
    pub database: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Maximum number of physical connections
    pub pool_size: usize,
    /// Share of `pool_size` kept open while idle (rounded up)
    pub min_idle_fraction: f64,
    /// Timeout for establishing one physical connection
    pub connect_timeout_ms: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            database: String::new(),
            username: "root".to_string(),
            password: String::new(),
            pool_size: 10,
            min_idle_fraction: 0.5,
            connect_timeout_ms: 10_000,
        }
    }
}

impl MysqlConfig {
    /// Build a configuration from a `host:port` address and credentials
    ///
    /// The port is optional and defaults to 3306.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the address is empty or the port is not a number.
    pub fn from_address(
        address: &str,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DatabaseError::usage(format!("invalid port in '{}'", address)))?;
                (host, port)
            }
            None => (address, 3306),
        };
        if host.is_empty() {
            return Err(DatabaseError::usage(format!(
                "missing host in '{}'",
                address
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        })
    }

    /// Set maximum pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the idle fraction of the pool
    pub fn with_min_idle_fraction(mut self, fraction: f64) -> Self {
        self.min_idle_fraction = fraction;
        self
    }

    /// Connections kept open while idle: `ceil(pool_size * fraction)`, clamped to `1..=pool_size`
    pub fn min_idle(&self) -> usize {
        let size = self.pool_size.max(1);
        let fraction = self.min_idle_fraction.clamp(0.0, 1.0);
        ((size as f64 * fraction).ceil() as usize).clamp(1, size)
    }

    /// Target used in logs and connection errors
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Pool sizing derived from this configuration
    pub fn pool_config(&self) -> LeasedPoolConfig {
        LeasedPoolConfig {
            max_size: self.pool_size.max(1),
            min_idle: self.min_idle(),
        }
    }
}

/// Sizing of a leased pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeasedPoolConfig {
    /// Maximum number of physical connections
    pub max_size: usize,
    /// Connections opened eagerly at initialization
    pub min_idle: usize,
}

impl Default for LeasedPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 5,
        }
    }
}

impl LeasedPoolConfig {
    /// Pool of at most `max_size` connections, half of them opened eagerly
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            min_idle: max_size.div_ceil(2),
        }
    }

    /// Set the number of eagerly opened connections
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle.min(self.max_size);
        self
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Default wait for a lease in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
        }
    }
}

impl ManagerConfig {
    /// Set the default acquisition timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default acquisition timeout as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
