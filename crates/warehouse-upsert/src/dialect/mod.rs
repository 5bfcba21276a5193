//! SQL Server dialect: typed statements and their T-SQL rendering.
//!
//! The upsert protocol never formats SQL by hand; it builds a [`Statement`]
//! and lets the target render or interpret it.
//!
//! ```rust,ignore
//! let merge = MergeStatement::new(&target, &staging, dataset.columns(), &keys)?;
//! let sql = Statement::Merge(merge).render()?;
//! ```

mod statement;

pub use statement::{ColumnDef, CreateTable, MergeStatement, Statement};
