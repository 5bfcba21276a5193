//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Warehouse database (SQL Server) configuration.
    pub target: TargetConfig,

    /// Load behavior configuration.
    #[serde(default)]
    pub upsert: UpsertConfig,
}

/// How the loader authenticates against SQL Server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// SQL Server login with user and password.
    #[default]
    SqlServer,

    /// Windows integrated security (trusted connection).
    Integrated,
}

/// Target database (SQL Server) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Authentication mode (default: sql_server).
    #[serde(default)]
    pub auth: AuthMode,

    /// Username (SQL Server authentication only).
    #[serde(default)]
    pub user: String,

    /// Password (SQL Server authentication only).
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("auth", &self.auth)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Upsert behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertConfig {
    /// Rows per bulk-load round-trip into staging (default: 200).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per load before giving up (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in seconds (default: 5).
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl UpsertConfig {
    /// Delay between attempts.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

// Default value functions for serde
pub(crate) fn default_mssql_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_max_connections() -> u32 {
    4
}

pub(crate) fn default_batch_size() -> usize {
    200
}

pub(crate) fn default_max_retries() -> u32 {
    3
}

pub(crate) fn default_retry_backoff_secs() -> u64 {
    5
}
