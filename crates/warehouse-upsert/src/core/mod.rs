//! Core types shared by the statement builder, targets and the engine.
//!
//! - [`identifier`]: validated, bracket-quoted SQL Server names and [`TableName`]
//! - [`schema`]: the closed [`ColumnType`] set and the ordered [`ColumnTypeMap`]
//! - [`value`]: cell values and the rectangular [`Dataset`]

pub mod identifier;
pub mod schema;
pub mod value;

pub use identifier::{quote_literal, quote_mssql, validate_identifier, TableName};
pub use schema::{ColumnSpec, ColumnType, ColumnTypeMap};
pub use value::{Dataset, SqlValue};
