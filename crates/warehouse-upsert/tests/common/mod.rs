//! In-memory SQL Server stand-in for engine tests.
//!
//! Tables live in a shared map. `begin` snapshots the map and `rollback`
//! restores it, so a failed attempt leaves no trace. Faults can be armed per
//! step to fail the next N calls with a transient or permanent error.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warehouse_upsert::dialect::{MergeStatement, Statement};
use warehouse_upsert::{
    Backoff, ColumnTypeMap, ConnectionProvider, LoadError, Result, SqlValue, TableName,
    TargetConnection,
};

#[derive(Debug, Clone)]
pub struct MemTable {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub not_null: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl MemTable {
    fn index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    /// Enforce NOT NULL and primary key uniqueness for a new row.
    fn check_insert(&self, table: &str, row: &[SqlValue]) -> Result<()> {
        for column in self.not_null.iter().chain(&self.primary_key) {
            if let Some(i) = self.index(column) {
                if row[i].is_null() {
                    return Err(permanent(
                        table,
                        format!("Cannot insert the value NULL into column '{}'", column),
                    ));
                }
            }
        }
        if !self.primary_key.is_empty() {
            let pk: Vec<usize> = self
                .primary_key
                .iter()
                .filter_map(|c| self.index(c))
                .collect();
            if self
                .rows
                .iter()
                .any(|existing| pk.iter().all(|&i| existing[i] == row[i]))
            {
                return Err(permanent(table, "Violation of PRIMARY KEY constraint"));
            }
        }
        Ok(())
    }
}

type Tables = HashMap<String, MemTable>;

#[derive(Debug, Clone)]
struct Fault {
    step: String,
    remaining: u32,
    transient: bool,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<Vec<Fault>>,
    log: Mutex<Vec<String>>,
    acquires: AtomicU32,
    disposes: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
}

impl Shared {
    /// Fail if a fault is armed for `step`.
    fn trip(&self, step: &str, table: &str) -> Result<()> {
        self.log.lock().unwrap().push(step.to_string());
        let mut faults = self.faults.lock().unwrap();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.step == step && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(LoadError::Statement {
                table: table.to_string(),
                message: format!("injected failure at {}", step),
                transient: fault.transient,
            });
        }
        Ok(())
    }
}

fn permanent(table: &str, message: impl Into<String>) -> LoadError {
    LoadError::Statement {
        table: table.to_string(),
        message: message.into(),
        transient: false,
    }
}

/// Provider backed by in-memory tables.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `step` with a transient error.
    pub fn fail_transient(&self, step: &str, times: u32) {
        self.arm(step, times, true);
    }

    /// Fail the next `times` calls of `step` with a permanent error.
    pub fn fail_permanent(&self, step: &str, times: u32) {
        self.arm(step, times, false);
    }

    fn arm(&self, step: &str, times: u32, transient: bool) {
        self.shared.faults.lock().unwrap().push(Fault {
            step: step.to_string(),
            remaining: times,
            transient,
        });
    }

    /// Create a table directly, outside any transaction.
    pub fn create_table(&self, name: &str, columns: &[&str], primary_key: &[&str]) {
        let table = MemTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            not_null: Vec::new(),
            rows: Vec::new(),
        };
        self.shared
            .tables
            .lock()
            .unwrap()
            .insert(key(&TableName::parse(name).unwrap()), table);
    }

    /// Insert rows directly, outside any transaction.
    pub fn insert_rows(&self, name: &str, rows: Vec<Vec<SqlValue>>) {
        let mut tables = self.shared.tables.lock().unwrap();
        let table = tables
            .get_mut(&key(&TableName::parse(name).unwrap()))
            .expect("table exists");
        table.rows.extend(rows);
    }

    pub fn table(&self, name: &str) -> Option<MemTable> {
        self.shared
            .tables
            .lock()
            .unwrap()
            .get(&key(&TableName::parse(name).unwrap()))
            .cloned()
    }

    /// Rows sorted by their display form, for order-independent comparison.
    pub fn sorted_rows(&self, name: &str) -> Vec<Vec<SqlValue>> {
        let mut rows = self.table(name).map(|t| t.rows).unwrap_or_default();
        rows.sort_by_key(|r| format!("{:?}", r));
        rows
    }

    pub fn exists(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Steps executed so far, in order.
    pub fn steps(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn acquires(&self) -> u32 {
        self.shared.acquires.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> u32 {
        self.shared.disposes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>> {
        self.shared.acquires.fetch_add(1, Ordering::SeqCst);
        self.shared.trip("acquire", "")?;
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            snapshot: None,
        }))
    }

    async fn dispose(&self) {
        self.shared.disposes.fetch_add(1, Ordering::SeqCst);
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

fn key(table: &TableName) -> String {
    table.to_string().to_lowercase()
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
    snapshot: Option<Tables>,
}

impl MemoryConnection {
    fn merge(tables: &mut Tables, merge: &MergeStatement) -> Result<u64> {
        let target_name = merge.target.to_string();
        let staging = tables
            .get(&key(&merge.staging))
            .cloned()
            .ok_or_else(|| permanent(&target_name, "Invalid object name (staging)"))?;
        let target = tables
            .get_mut(&key(&merge.target))
            .ok_or_else(|| permanent(&target_name, "Invalid object name (target)"))?;

        let mut affected = 0u64;
        for source_row in &staging.rows {
            let matched = target.rows.iter().position(|target_row| {
                merge.keys.iter().all(|k| {
                    let (Some(s), Some(t)) = (staging.index(k), target.index(k)) else {
                        return false;
                    };
                    // NULL never equals anything
                    !source_row[s].is_null() && source_row[s] == target_row[t]
                })
            });

            match matched {
                Some(pos) => {
                    for col in merge.update_columns() {
                        if let (Some(s), Some(t)) = (staging.index(col), target.index(col)) {
                            target.rows[pos][t] = source_row[s].clone();
                        }
                    }
                }
                None => {
                    let mut row = vec![SqlValue::Null; target.columns.len()];
                    for col in &merge.columns {
                        if let (Some(s), Some(t)) = (staging.index(col), target.index(col)) {
                            row[t] = source_row[s].clone();
                        }
                    }
                    target.check_insert(&target_name, &row)?;
                    target.rows.push(row);
                }
            }
            affected += 1;
        }
        Ok(affected)
    }
}

#[async_trait]
impl TargetConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<()> {
        self.shared.trip("begin", "")?;
        self.snapshot = Some(self.shared.tables.lock().unwrap().clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.shared.trip("commit", "")?;
        self.snapshot = None;
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshot) = self.snapshot.take() {
            *self.shared.tables.lock().unwrap() = snapshot;
        }
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        self.shared.trip("table exists", &table.to_string())?;
        Ok(self.shared.tables.lock().unwrap().contains_key(&key(table)))
    }

    async fn table_columns(&mut self, table: &TableName) -> Result<Vec<String>> {
        self.shared.trip("table columns", &table.to_string())?;
        Ok(self
            .shared
            .tables
            .lock()
            .unwrap()
            .get(&key(table))
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn row_count(&mut self, table: &TableName) -> Result<i64> {
        self.shared.trip("row count", &table.to_string())?;
        self.shared
            .tables
            .lock()
            .unwrap()
            .get(&key(table))
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| permanent(&table.to_string(), "Invalid object name"))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let name = statement.table().to_string();
        self.shared.trip(statement.kind(), &name)?;
        // Rendering must succeed for anything the real target would run.
        statement.render()?;

        let mut tables = self.shared.tables.lock().unwrap();
        match statement {
            Statement::CreateTable(create) => {
                if tables.contains_key(&key(&create.table)) {
                    return Err(permanent(&name, "There is already an object named"));
                }
                tables.insert(
                    key(&create.table),
                    MemTable {
                        columns: create.columns.iter().map(|c| c.name.clone()).collect(),
                        primary_key: create.primary_key.clone(),
                        not_null: create
                            .columns
                            .iter()
                            .filter(|c| !c.nullable)
                            .map(|c| c.name.clone())
                            .collect(),
                        rows: Vec::new(),
                    },
                );
                Ok(0)
            }
            Statement::CloneEmpty { staging, source } => {
                if !tables.contains_key(&key(staging)) {
                    let source = tables
                        .get(&key(source))
                        .ok_or_else(|| permanent(&name, "Invalid object name"))?;
                    let clone = MemTable {
                        columns: source.columns.clone(),
                        primary_key: Vec::new(),
                        not_null: Vec::new(),
                        rows: Vec::new(),
                    };
                    tables.insert(key(staging), clone);
                }
                Ok(0)
            }
            Statement::Truncate(table) => {
                let table = tables
                    .get_mut(&key(table))
                    .ok_or_else(|| permanent(&name, "Invalid object name"))?;
                table.rows.clear();
                Ok(0)
            }
            Statement::Merge(merge) => Self::merge(&mut tables, merge),
            Statement::DropIfExists(table) => {
                tables.remove(&key(table));
                Ok(0)
            }
        }
    }

    async fn bulk_insert(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        types: &ColumnTypeMap,
    ) -> Result<u64> {
        let name = table.to_string();
        self.shared.trip("bulk insert", &name)?;

        let mut tables = self.shared.tables.lock().unwrap();
        let target = tables
            .get_mut(&key(table))
            .ok_or_else(|| permanent(&name, "Invalid object name"))?;

        let mut positions = Vec::with_capacity(columns.len());
        for column in columns {
            if !types.contains(column) {
                return Err(LoadError::MissingColumnType {
                    table: name.clone(),
                    column: column.clone(),
                });
            }
            let idx = target
                .index(column)
                .ok_or_else(|| permanent(&name, format!("Invalid column name '{}'", column)))?;
            positions.push(idx);
        }

        for row in rows {
            let mut stored = vec![SqlValue::Null; target.columns.len()];
            for (value, &idx) in row.iter().zip(&positions) {
                stored[idx] = value.clone();
            }
            target.check_insert(&name, &stored)?;
            target.rows.push(stored);
        }
        Ok(rows.len() as u64)
    }
}

/// Backoff that records each call and never waits.
#[derive(Clone, Default)]
pub struct RecordingBackoff {
    calls: Arc<Mutex<Vec<u32>>>,
}

impl RecordingBackoff {
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl Backoff for RecordingBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.calls.lock().unwrap().push(attempt);
        Duration::ZERO
    }
}
