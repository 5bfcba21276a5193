//! Connection provider abstraction for the warehouse target.
//!
//! The upsert engine depends only on these traits:
//!
//! - [`ConnectionProvider`] hands out connections and can drop every pooled
//!   connection after a transient failure so the next attempt reconnects.
//! - [`TargetConnection`] is one connection with explicit transaction control
//!   and the handful of operations the staging/merge protocol needs.
//!
//! [`MssqlProvider`] is the SQL Server implementation.

pub mod mssql;

use async_trait::async_trait;

use crate::core::{ColumnTypeMap, SqlValue, TableName};
use crate::dialect::Statement;
use crate::error::Result;

pub use mssql::MssqlProvider;

/// Source of transactional connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a connection. No transaction is open on it yet.
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>>;

    /// Invalidate pooled connections; later acquisitions reconnect.
    async fn dispose(&self);

    /// Get the database type.
    fn db_type(&self) -> &str;
}

/// A single connection to the target database.
///
/// Every write issued between [`begin`](Self::begin) and
/// [`commit`](Self::commit) is applied atomically; [`rollback`](Self::rollback)
/// discards all of it, including DDL.
#[async_trait]
pub trait TargetConnection: Send {
    /// Open a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Check if a table exists.
    async fn table_exists(&mut self, table: &TableName) -> Result<bool>;

    /// Column names of an existing table, in ordinal order.
    async fn table_columns(&mut self, table: &TableName) -> Result<Vec<String>>;

    /// Get the row count for a table.
    async fn row_count(&mut self, table: &TableName) -> Result<i64>;

    /// Execute a DDL/DML statement; returns rows affected where known.
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    /// Insert one chunk of rows into `table`.
    ///
    /// `columns` names the position of each value in `rows`; `types` gives
    /// the declared type of each column for value encoding.
    async fn bulk_insert(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        types: &ColumnTypeMap,
    ) -> Result<u64>;
}
