//! Error types for the warehouse loader.

use thiserror::Error;

/// SQL Server error numbers that are worth retrying.
///
/// - 1205: chosen as deadlock victim
/// - 1222: lock request time out
/// - 233, 64, 10053, 10054, 10060: connection dropped or unreachable
/// - 40197, 40501, 40613, 49918, 49919, 49920: Azure SQL failover/throttling
const TRANSIENT_SERVER_CODES: &[u32] = &[
    1205, 1222, 233, 64, 10053, 10054, 10060, 40197, 40501, 40613, 49918, 49919, 49920,
];

/// Main error type for load operations.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A column type literal or descriptor that cannot be rendered as SQL
    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),

    /// A dataset or key column has no entry in the column type map
    #[error("Column {column} of table {table} has no declared type")]
    MissingColumnType { table: String, column: String },

    /// Existing target table lacks columns declared in the column type map
    #[error("Table {table} is missing columns {missing:?} - add them before loading")]
    SchemaDrift { table: String, missing: Vec<String> },

    /// Dataset is malformed or inconsistent with the request
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    /// The same key tuple appears more than once in one batch
    #[error("Duplicate key {key} in batch for table {table}")]
    DuplicateKey { table: String, key: String },

    /// A statement against a specific table failed
    #[error("Statement failed for table {table}: {message}")]
    Statement {
        table: String,
        message: String,
        transient: bool,
    },

    /// All attempts failed with transient errors
    #[error("Load into {table} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        table: String,
        attempts: u32,
        #[source]
        last_error: Box<LoadError>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoadError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        LoadError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Wrap a database error that happened while working on `table`.
    ///
    /// The transient classification of the underlying error is preserved.
    pub fn statement(table: impl Into<String>, what: &str, err: tiberius::error::Error) -> Self {
        LoadError::Statement {
            table: table.into(),
            transient: is_transient_db_error(&err),
            message: format!("{}: {}", what, err),
        }
    }

    /// Whether retrying the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LoadError::Database(e) => is_transient_db_error(e),
            LoadError::Pool { .. } => true,
            LoadError::Statement { transient, .. } => *transient,
            LoadError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            LoadError::Config(_)
            | LoadError::UnsupportedType(_)
            | LoadError::MissingColumnType { .. }
            | LoadError::SchemaDrift { .. }
            | LoadError::Yaml(_) => 2,
            LoadError::RetriesExhausted { .. } => 3,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Classify a tiberius error as transient (connection, lock or throttling).
pub fn is_transient_db_error(e: &tiberius::error::Error) -> bool {
    use tiberius::error::Error;

    if e.is_deadlock() {
        return true;
    }
    match e {
        Error::Io { .. } | Error::Routing { .. } => true,
        Error::Server(token) => TRANSIENT_SERVER_CODES.contains(&token.code()),
        _ => false,
    }
}

/// Result type alias for load operations.
pub type Result<T> = std::result::Result<T, LoadError>;
