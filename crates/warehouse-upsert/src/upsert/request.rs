//! Load requests and their outcome.

use std::collections::HashSet;

use serde::Serialize;
use tracing::warn;

use crate::config::UpsertConfig;
use crate::core::{ColumnType, ColumnTypeMap, Dataset, TableName};
use crate::error::{LoadError, Result};

/// Upsert `dataset` into `target`, matching rows on `keys`.
#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub target: TableName,
    pub keys: Vec<String>,
    pub column_types: ColumnTypeMap,
    /// Defaults to `<target>_stg` in the target's schema.
    pub staging: Option<TableName>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
}

impl UpsertRequest {
    pub fn new<I, S>(target: TableName, keys: I, column_types: ColumnTypeMap) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target,
            keys: keys.into_iter().map(Into::into).collect(),
            column_types,
            staging: None,
            batch_size: None,
            max_retries: None,
        }
    }

    pub fn with_staging(mut self, staging: TableName) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Append `dataset` to `target` without matching.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub target: TableName,
    pub column_types: ColumnTypeMap,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
}

impl AppendRequest {
    pub fn new(target: TableName, column_types: ColumnTypeMap) -> Self {
        Self {
            target,
            column_types,
            batch_size: None,
            max_retries: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Row counts observed by a successful load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub table: String,
    pub rows_before: i64,
    pub rows_after: i64,
    /// `rows_after - rows_before`.
    pub rows_inserted: i64,
    /// Rows written to staging (or to the target in append mode).
    pub rows_staged: u64,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// A validated upsert, ready to run.
#[derive(Debug, Clone)]
pub(crate) struct UpsertPlan {
    pub target: TableName,
    pub staging: TableName,
    pub keys: Vec<String>,
    pub batch_size: usize,
    pub max_retries: u32,
}

/// A validated append, ready to run.
#[derive(Debug, Clone)]
pub(crate) struct AppendPlan {
    pub target: TableName,
    pub batch_size: usize,
    pub max_retries: u32,
}

fn resolve_limits(
    table: &TableName,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    defaults: &UpsertConfig,
) -> Result<(usize, u32)> {
    let batch_size = batch_size.unwrap_or(defaults.batch_size);
    let max_retries = max_retries.unwrap_or(defaults.max_retries);
    if batch_size == 0 {
        return Err(LoadError::Config(format!(
            "batch_size for {} must be at least 1",
            table
        )));
    }
    if max_retries == 0 {
        return Err(LoadError::Config(format!(
            "max_retries for {} must be at least 1",
            table
        )));
    }
    Ok((batch_size, max_retries))
}

/// Every dataset column must have a renderable declared type.
fn check_column_types(table: &TableName, dataset: &Dataset, types: &ColumnTypeMap) -> Result<()> {
    for column in dataset.columns() {
        match types.get(column) {
            Some(column_type) => {
                column_type.render()?;
            }
            None => {
                return Err(LoadError::MissingColumnType {
                    table: table.to_string(),
                    column: column.clone(),
                })
            }
        }
    }
    Ok(())
}

impl UpsertRequest {
    pub(crate) fn plan(&self, dataset: &Dataset, defaults: &UpsertConfig) -> Result<UpsertPlan> {
        let table = &self.target;
        let (batch_size, max_retries) =
            resolve_limits(table, self.batch_size, self.max_retries, defaults)?;

        if self.keys.is_empty() {
            return Err(LoadError::Config(format!(
                "upsert into {} needs at least one key column",
                table
            )));
        }
        let mut seen = HashSet::new();
        for key in &self.keys {
            if !seen.insert(key.as_str()) {
                return Err(LoadError::Config(format!(
                    "key column {:?} is listed twice for {}",
                    key, table
                )));
            }
            if dataset.column_index(key).is_none() {
                return Err(LoadError::InvalidDataset(format!(
                    "key column {:?} is not present in the dataset for {}",
                    key, table
                )));
            }
            match self.column_types.get(key) {
                None => {
                    return Err(LoadError::MissingColumnType {
                        table: table.to_string(),
                        column: key.clone(),
                    })
                }
                // NVARCHAR(MAX) cannot be part of a primary key
                Some(ColumnType::Text) => {
                    return Err(LoadError::UnsupportedType(format!(
                        "key column {:?} of {} is NVARCHAR(MAX); declare a bounded length",
                        key, table
                    )))
                }
                Some(_) => {}
            }
        }
        check_column_types(table, dataset, &self.column_types)?;

        let staging = match &self.staging {
            Some(staging) => staging.clone(),
            None => table.staging()?,
        };
        if staging == *table {
            return Err(LoadError::Config(format!(
                "staging table must differ from target {}",
                table
            )));
        }

        check_key_tuples(table, dataset, &self.keys)?;

        Ok(UpsertPlan {
            target: table.clone(),
            staging,
            keys: self.keys.clone(),
            batch_size,
            max_retries,
        })
    }
}

impl AppendRequest {
    pub(crate) fn plan(&self, dataset: &Dataset, defaults: &UpsertConfig) -> Result<AppendPlan> {
        let (batch_size, max_retries) =
            resolve_limits(&self.target, self.batch_size, self.max_retries, defaults)?;
        check_column_types(&self.target, dataset, &self.column_types)?;
        Ok(AppendPlan {
            target: self.target.clone(),
            batch_size,
            max_retries,
        })
    }
}

/// Reject repeated key tuples; warn about tuples containing NULL.
///
/// A MERGE cannot update one target row from two source rows, and a key
/// containing NULL never matches an existing row.
fn check_key_tuples(table: &TableName, dataset: &Dataset, keys: &[String]) -> Result<()> {
    let positions: Vec<usize> = keys
        .iter()
        .filter_map(|k| dataset.column_index(k))
        .collect();

    let mut seen: HashSet<Vec<String>> = HashSet::with_capacity(dataset.len());
    let mut null_keys = 0usize;
    for row in dataset.rows() {
        if positions.iter().any(|&i| row[i].is_null()) {
            null_keys += 1;
            continue;
        }
        let tuple: Vec<String> = positions.iter().map(|&i| row[i].to_string()).collect();
        if seen.contains(&tuple) {
            return Err(LoadError::DuplicateKey {
                table: table.to_string(),
                key: format!("({})", tuple.join(", ")),
            });
        }
        seen.insert(tuple);
    }

    if null_keys > 0 {
        warn!(
            "{}: {} rows have a NULL key column and will never match existing rows",
            table, null_keys
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnType, SqlValue};

    fn types() -> ColumnTypeMap {
        ColumnTypeMap::new()
            .with("Article", ColumnType::NVarChar(20))
            .with("Site", ColumnType::NVarChar(10))
            .with("Stock", ColumnType::Integer)
    }

    fn dataset(rows: Vec<Vec<SqlValue>>) -> Dataset {
        Dataset::from_rows(["Article", "Site", "Stock"], rows).unwrap()
    }

    fn table() -> TableName {
        TableName::parse("dbo.StockLevels").unwrap()
    }

    #[test]
    fn test_plan_applies_defaults() {
        let data = dataset(vec![vec!["A1".into(), "S1".into(), SqlValue::I32(5)]]);
        let plan = UpsertRequest::new(table(), ["Article", "Site"], types())
            .plan(&data, &UpsertConfig::default())
            .unwrap();
        assert_eq!(plan.batch_size, 200);
        assert_eq!(plan.max_retries, 3);
        assert_eq!(plan.staging.to_string(), "dbo.StockLevels_stg");
    }

    #[test]
    fn test_plan_rejects_bad_keys() {
        let data = dataset(vec![]);
        let defaults = UpsertConfig::default();

        let empty: [&str; 0] = [];
        let err = UpsertRequest::new(table(), empty, types())
            .plan(&data, &defaults)
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));

        let err = UpsertRequest::new(table(), ["Plant"], types())
            .plan(&data, &defaults)
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidDataset(_)));

        let err = UpsertRequest::new(table(), ["Site", "Site"], types())
            .plan(&data, &defaults)
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_plan_requires_types_for_every_column() {
        let data = dataset(vec![]);
        let partial = ColumnTypeMap::new()
            .with("Article", ColumnType::NVarChar(20))
            .with("Site", ColumnType::NVarChar(10));
        let err = UpsertRequest::new(table(), ["Article"], partial)
            .plan(&data, &UpsertConfig::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::MissingColumnType { ref column, .. } if column == "Stock"));
    }

    #[test]
    fn test_plan_rejects_unrenderable_type() {
        let data = dataset(vec![]);
        let bad = types().with("Stock", ColumnType::NVarChar(0));
        let err = UpsertRequest::new(table(), ["Article"], bad)
            .plan(&data, &UpsertConfig::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedType(_)));
    }

    #[test]
    fn test_plan_rejects_zero_limits_and_self_staging() {
        let data = dataset(vec![]);
        let defaults = UpsertConfig::default();
        assert!(UpsertRequest::new(table(), ["Article"], types())
            .with_batch_size(0)
            .plan(&data, &defaults)
            .is_err());
        assert!(UpsertRequest::new(table(), ["Article"], types())
            .with_max_retries(0)
            .plan(&data, &defaults)
            .is_err());
        assert!(UpsertRequest::new(table(), ["Article"], types())
            .with_staging(table())
            .plan(&data, &defaults)
            .is_err());
    }

    #[test]
    fn test_plan_rejects_duplicate_key_tuples() {
        let data = dataset(vec![
            vec!["A1".into(), "S1".into(), SqlValue::I32(5)],
            vec!["A1".into(), "S2".into(), SqlValue::I32(6)],
            vec!["A1".into(), "S1".into(), SqlValue::I32(7)],
        ]);
        let err = UpsertRequest::new(table(), ["Article", "Site"], types())
            .plan(&data, &UpsertConfig::default())
            .unwrap_err();
        match err {
            LoadError::DuplicateKey { table, key } => {
                assert_eq!(table, "dbo.StockLevels");
                assert_eq!(key, "('A1', 'S1')");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_keeps_distinct_tuples_whose_text_looks_alike() {
        let data = dataset(vec![
            vec!["x', 'y".into(), "z".into(), SqlValue::I32(1)],
            vec!["x".into(), "y', 'z".into(), SqlValue::I32(2)],
        ]);
        assert!(UpsertRequest::new(table(), ["Article", "Site"], types())
            .plan(&data, &UpsertConfig::default())
            .is_ok());
    }

    #[test]
    fn test_plan_rejects_unbounded_text_key() {
        let data = dataset(vec![]);
        let text_key = types().with("Article", ColumnType::Text);
        let err = UpsertRequest::new(table(), ["Article"], text_key)
            .plan(&data, &UpsertConfig::default())
            .unwrap_err();
        match err {
            LoadError::UnsupportedType(message) => assert!(message.contains("Article")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_allows_null_keys() {
        let data = dataset(vec![
            vec!["A1".into(), SqlValue::Null, SqlValue::I32(5)],
            vec!["A1".into(), SqlValue::Null, SqlValue::I32(6)],
        ]);
        assert!(UpsertRequest::new(table(), ["Article", "Site"], types())
            .plan(&data, &UpsertConfig::default())
            .is_ok());
    }

    #[test]
    fn test_append_plan() {
        let data = dataset(vec![]);
        let plan = AppendRequest::new(table(), types())
            .with_batch_size(50)
            .plan(&data, &UpsertConfig::default())
            .unwrap();
        assert_eq!(plan.batch_size, 50);
        assert_eq!(plan.max_retries, 3);
    }
}
