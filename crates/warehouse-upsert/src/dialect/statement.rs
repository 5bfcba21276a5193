//! Typed SQL Server statements issued by the upsert protocol.
//!
//! Statements are built from structured input ([`ColumnTypeMap`], key lists,
//! [`TableName`]s) and only turned into text by [`Statement::render`], which
//! quotes every identifier. Targets that do not speak SQL (the in-memory
//! target used in tests) can interpret the typed form directly.

use crate::core::identifier::{quote_literal, quote_mssql};
use crate::core::{ColumnType, ColumnTypeMap, TableName};
use crate::error::{LoadError, Result};

/// A column in a `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// `CREATE TABLE` with an optional composite primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub table: TableName,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl CreateTable {
    /// Synthesize a table definition from a type map.
    ///
    /// Columns follow the map's order. Key columns are declared `NOT NULL`;
    /// every other column is nullable. An empty `keys` slice creates a heap
    /// without a primary key.
    pub fn from_type_map(table: &TableName, types: &ColumnTypeMap, keys: &[String]) -> Result<Self> {
        for key in keys {
            if !types.contains(key) {
                return Err(LoadError::MissingColumnType {
                    table: table.to_string(),
                    column: key.clone(),
                });
            }
        }

        let columns = types
            .iter()
            .map(|(name, column_type)| {
                column_type.render()?;
                Ok(ColumnDef {
                    name: name.to_string(),
                    column_type,
                    nullable: !keys.iter().any(|k| k == name),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if columns.is_empty() {
            return Err(LoadError::Config(format!(
                "cannot create {} without columns",
                table
            )));
        }

        Ok(Self {
            table: table.clone(),
            columns,
            primary_key: keys.to_vec(),
        })
    }

    fn render(&self) -> Result<String> {
        let mut defs = Vec::with_capacity(self.columns.len() + 1);
        for col in &self.columns {
            let null_clause = if col.nullable { "NULL" } else { "NOT NULL" };
            defs.push(format!(
                "{} {} {}",
                quote_mssql(&col.name)?,
                col.column_type.render()?,
                null_clause
            ));
        }

        if !self.primary_key.is_empty() {
            let pk_cols = self
                .primary_key
                .iter()
                .map(|c| quote_mssql(c))
                .collect::<Result<Vec<_>>>()?;
            defs.push(format!(
                "CONSTRAINT {} PRIMARY KEY ({})",
                quote_mssql(&self.table.primary_key_name())?,
                pk_cols.join(", ")
            ));
        }

        Ok(format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.table.quoted(),
            defs.join(",\n    ")
        ))
    }
}

/// Set-based upsert from a staging table into its target.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeStatement {
    pub target: TableName,
    pub staging: TableName,
    /// Every column carried by the batch, in dataset order.
    pub columns: Vec<String>,
    /// Uniqueness constraint; rows match when all of these are equal.
    pub keys: Vec<String>,
}

impl MergeStatement {
    pub fn new(
        target: &TableName,
        staging: &TableName,
        columns: &[String],
        keys: &[String],
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(LoadError::Config(format!(
                "merge into {} needs at least one key column",
                target
            )));
        }
        if let Some(missing) = keys.iter().find(|k| !columns.contains(k)) {
            return Err(LoadError::InvalidDataset(format!(
                "key column {:?} is not present in the batch for {}",
                missing, target
            )));
        }

        Ok(Self {
            target: target.clone(),
            staging: staging.clone(),
            columns: columns.to_vec(),
            keys: keys.to_vec(),
        })
    }

    /// Columns overwritten when a key matches.
    pub fn update_columns(&self) -> impl Iterator<Item = &String> {
        self.columns.iter().filter(move |c| !self.keys.contains(c))
    }

    fn render(&self) -> Result<String> {
        let quoted_cols = self
            .columns
            .iter()
            .map(|c| quote_mssql(c))
            .collect::<Result<Vec<_>>>()?;

        let join_condition = self
            .keys
            .iter()
            .map(|k| {
                let q = quote_mssql(k)?;
                Ok(format!("target.{0} = source.{0}", q))
            })
            .collect::<Result<Vec<_>>>()?;

        let update_set = self
            .update_columns()
            .map(|c| {
                let q = quote_mssql(c)?;
                Ok(format!("{0} = source.{0}", q))
            })
            .collect::<Result<Vec<_>>>()?;

        let source_cols: Vec<String> = quoted_cols
            .iter()
            .map(|q| format!("source.{}", q))
            .collect();

        // WITH (TABLOCK) serializes MERGE operations to prevent S->X lock conversion deadlocks
        let mut sql = format!(
            "MERGE INTO {} WITH (TABLOCK) AS target\nUSING {} AS source\nON ({})\n",
            self.target.quoted(),
            self.staging.quoted(),
            join_condition.join(" AND ")
        );

        // Key-only batches have nothing to update.
        if !update_set.is_empty() {
            sql.push_str(&format!(
                "WHEN MATCHED THEN UPDATE SET {}\n",
                update_set.join(", ")
            ));
        }

        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            quoted_cols.join(", "),
            source_cols.join(", ")
        ));

        Ok(sql)
    }
}

/// A statement in the staging/merge protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Provision a table.
    CreateTable(CreateTable),

    /// Create `staging` as an empty, constraint-free copy of `source` unless
    /// it already exists.
    CloneEmpty {
        staging: TableName,
        source: TableName,
    },

    /// Remove all rows.
    Truncate(TableName),

    /// Upsert staging into target.
    Merge(MergeStatement),

    /// Drop a table if it exists.
    DropIfExists(TableName),
}

impl Statement {
    /// The table this statement writes to.
    pub fn table(&self) -> &TableName {
        match self {
            Statement::CreateTable(create) => &create.table,
            Statement::CloneEmpty { staging, .. } => staging,
            Statement::Truncate(table) | Statement::DropIfExists(table) => table,
            Statement::Merge(merge) => &merge.target,
        }
    }

    /// Short label for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::CreateTable(_) => "create table",
            Statement::CloneEmpty { .. } => "create staging",
            Statement::Truncate(_) => "truncate",
            Statement::Merge(_) => "merge",
            Statement::DropIfExists(_) => "drop",
        }
    }

    /// Render SQL Server T-SQL text.
    pub fn render(&self) -> Result<String> {
        match self {
            Statement::CreateTable(create) => create.render(),
            Statement::CloneEmpty { staging, source } => Ok(format!(
                "IF OBJECT_ID({}, N'U') IS NULL SELECT TOP 0 * INTO {} FROM {}",
                quote_literal(&staging.quoted()),
                staging.quoted(),
                source.quoted()
            )),
            Statement::Truncate(table) => Ok(format!("TRUNCATE TABLE {}", table.quoted())),
            Statement::Merge(merge) => merge.render(),
            Statement::DropIfExists(table) => Ok(format!(
                "IF OBJECT_ID({}, N'U') IS NOT NULL DROP TABLE {}",
                quote_literal(&table.quoted()),
                table.quoted()
            )),
        }
    }
}
