//! # warehouse-upsert
//!
//! Idempotent loading of tabular report extracts into SQL Server.
//!
//! Each load goes through a staging table and a single `MERGE`:
//!
//! - **Provisioning** of the target table from a declared column type map,
//!   with a composite primary key over the unique-key columns
//! - **Staging** via an empty clone of the target, bulk-loaded in chunks
//! - **Merge** that updates matching rows and inserts new ones, never deleting
//! - **Whole-transaction retry** on transient failures with a fixed backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warehouse_upsert::{
//!     ColumnType, ColumnTypeMap, Config, Dataset, MssqlProvider, SqlValue, TableName, UpsertEngine,
//!     UpsertRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> warehouse_upsert::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let provider = Arc::new(MssqlProvider::connect(&config.target).await?);
//!     let engine = UpsertEngine::new(provider, config.upsert.clone());
//!
//!     let types = ColumnTypeMap::new()
//!         .with("Article", ColumnType::NVarChar(20))
//!         .with("Stock", ColumnType::Integer);
//!     let mut dataset = Dataset::new(["Article", "Stock"])?;
//!     dataset.push_row(vec!["A0001".into(), SqlValue::I32(12)])?;
//!
//!     let request = UpsertRequest::new(TableName::parse("dbo.StockLevels")?, ["Article"], types);
//!     let outcome = engine.upsert(&dataset, &request).await?;
//!     println!("{} rows inserted", outcome.rows_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dialect;
pub mod error;
pub mod target;
pub mod upsert;

// Re-exports for convenient access
pub use config::{AuthMode, Config, TargetConfig, UpsertConfig};
pub use crate::core::{ColumnSpec, ColumnType, ColumnTypeMap, Dataset, SqlValue, TableName};
pub use error::{LoadError, Result};
pub use target::mssql::HealthCheckResult;
pub use target::{ConnectionProvider, MssqlProvider, TargetConnection};
pub use upsert::{AppendRequest, Backoff, FixedBackoff, MergeOutcome, UpsertEngine, UpsertRequest};
