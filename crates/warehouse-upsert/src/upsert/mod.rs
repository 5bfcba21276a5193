//! Staging-table upsert engine.
//!
//! One load is one database transaction:
//!
//! 1. provision the target (or check it for schema drift)
//! 2. count target rows
//! 3. clone an empty staging table from the target and truncate it
//! 4. bulk-load the dataset into staging in `batch_size` chunks
//! 5. `MERGE` staging into the target on the key columns
//! 6. count target rows again and drop staging
//! 7. commit
//!
//! Any failure rolls the whole transaction back. Transient failures are
//! retried from step 1 on a fresh connection after a fixed delay, up to
//! `max_retries` attempts in total.

mod request;
mod retry;

pub use request::{AppendRequest, MergeOutcome, UpsertRequest};
pub use retry::{Backoff, FixedBackoff};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::UpsertConfig;
use crate::core::{ColumnTypeMap, Dataset, TableName};
use crate::dialect::{CreateTable, MergeStatement, Statement};
use crate::error::{LoadError, Result};
use crate::target::{ConnectionProvider, TargetConnection};
use request::{AppendPlan, UpsertPlan};

/// The work one attempt performs.
#[derive(Clone, Copy)]
enum Job<'a> {
    Upsert(&'a UpsertPlan),
    Append(&'a AppendPlan),
}

impl Job<'_> {
    fn target(&self) -> &TableName {
        match self {
            Job::Upsert(plan) => &plan.target,
            Job::Append(plan) => &plan.target,
        }
    }

    fn max_retries(&self) -> u32 {
        match self {
            Job::Upsert(plan) => plan.max_retries,
            Job::Append(plan) => plan.max_retries,
        }
    }
}

/// Loads datasets into SQL Server tables through a [`ConnectionProvider`].
pub struct UpsertEngine {
    provider: Arc<dyn ConnectionProvider>,
    config: UpsertConfig,
    backoff: Arc<dyn Backoff>,
}

impl UpsertEngine {
    /// Engine with a fixed backoff taken from `config`.
    pub fn new(provider: Arc<dyn ConnectionProvider>, config: UpsertConfig) -> Self {
        let backoff = Arc::new(FixedBackoff::new(config.retry_backoff()));
        Self {
            provider,
            config,
            backoff,
        }
    }

    /// Replace the delay policy between attempts.
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Upsert `dataset` into the request's target table.
    ///
    /// Rows whose keys match an existing row replace that row's non-key
    /// columns; all other rows are inserted. Rows are never deleted.
    pub async fn upsert(&self, dataset: &Dataset, request: &UpsertRequest) -> Result<MergeOutcome> {
        let plan = request.plan(dataset, &self.config)?;
        self.run(Job::Upsert(&plan), dataset, &request.column_types)
            .await
    }

    /// Append `dataset` to the request's target table without matching.
    pub async fn append(&self, dataset: &Dataset, request: &AppendRequest) -> Result<MergeOutcome> {
        let plan = request.plan(dataset, &self.config)?;
        self.run(Job::Append(&plan), dataset, &request.column_types)
            .await
    }

    async fn run(&self, job: Job<'_>, dataset: &Dataset, types: &ColumnTypeMap) -> Result<MergeOutcome> {
        let table = job.target();
        let max_retries = job.max_retries();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt(job, dataset, types).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    info!(
                        "{}: rows {} -> {} (+{}), {} staged in {} attempt(s)",
                        table,
                        outcome.rows_before,
                        outcome.rows_after,
                        outcome.rows_inserted,
                        outcome.rows_staged,
                        attempt
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "{}: attempt {}/{} failed: {}; retrying in {:?}",
                        table, attempt, max_retries, e, delay
                    );
                    self.provider.dispose().await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "{}: attempt {}/{} failed: {}; giving up",
                        table, attempt, max_retries, e
                    );
                    self.provider.dispose().await;
                    return Err(LoadError::RetriesExhausted {
                        table: table.to_string(),
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One transaction. The connection is released before returning.
    async fn attempt(&self, job: Job<'_>, dataset: &Dataset, types: &ColumnTypeMap) -> Result<MergeOutcome> {
        let mut conn = self.provider.acquire().await?;
        conn.begin().await?;

        let result = match job {
            Job::Upsert(plan) => upsert_steps(conn.as_mut(), plan, dataset, types).await,
            Job::Append(plan) => append_steps(conn.as_mut(), plan, dataset, types).await,
        };
        let result = match result {
            Ok(outcome) => conn.commit().await.map(|()| outcome),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(rollback_err) = conn.rollback().await {
                debug!("{}: rollback failed: {}", job.target(), rollback_err);
            }
        }
        result
    }
}

async fn upsert_steps(
    conn: &mut dyn TargetConnection,
    plan: &UpsertPlan,
    dataset: &Dataset,
    types: &ColumnTypeMap,
) -> Result<MergeOutcome> {
    ensure_target(conn, &plan.target, types, &plan.keys).await?;
    let rows_before = count_before(conn, &plan.target).await?;

    conn.execute(&Statement::CloneEmpty {
        staging: plan.staging.clone(),
        source: plan.target.clone(),
    })
    .await?;
    conn.execute(&Statement::Truncate(plan.staging.clone()))
        .await?;

    let rows_staged = load_chunks(conn, &plan.staging, dataset, types, plan.batch_size).await?;

    let merge = MergeStatement::new(&plan.target, &plan.staging, dataset.columns(), &plan.keys)?;
    let merged = conn.execute(&Statement::Merge(merge)).await?;
    debug!("{}: merge affected {} rows", plan.target, merged);

    let rows_after = conn.row_count(&plan.target).await?;
    conn.execute(&Statement::DropIfExists(plan.staging.clone()))
        .await?;

    Ok(MergeOutcome {
        table: plan.target.to_string(),
        rows_before,
        rows_after,
        rows_inserted: rows_after - rows_before,
        rows_staged,
        attempts: 0,
    })
}

async fn append_steps(
    conn: &mut dyn TargetConnection,
    plan: &AppendPlan,
    dataset: &Dataset,
    types: &ColumnTypeMap,
) -> Result<MergeOutcome> {
    ensure_target(conn, &plan.target, types, &[]).await?;
    let rows_before = count_before(conn, &plan.target).await?;
    let rows_staged = load_chunks(conn, &plan.target, dataset, types, plan.batch_size).await?;
    let rows_after = conn.row_count(&plan.target).await?;

    Ok(MergeOutcome {
        table: plan.target.to_string(),
        rows_before,
        rows_after,
        rows_inserted: rows_after - rows_before,
        rows_staged,
        attempts: 0,
    })
}

/// Create the target if it is missing; otherwise require every declared column.
async fn ensure_target(
    conn: &mut dyn TargetConnection,
    table: &TableName,
    types: &ColumnTypeMap,
    keys: &[String],
) -> Result<()> {
    if !conn.table_exists(table).await? {
        let create = CreateTable::from_type_map(table, types, keys)?;
        conn.execute(&Statement::CreateTable(create)).await?;
        info!("{}: created table", table);
        return Ok(());
    }

    let existing = conn.table_columns(table).await?;
    let missing: Vec<String> = types
        .names()
        .filter(|name| !existing.iter().any(|e| e.eq_ignore_ascii_case(name)))
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(LoadError::SchemaDrift {
            table: table.to_string(),
            missing,
        });
    }
    Ok(())
}

/// Row count before loading. A non-transient read failure counts as empty.
async fn count_before(conn: &mut dyn TargetConnection, table: &TableName) -> Result<i64> {
    match conn.row_count(table).await {
        Ok(count) => Ok(count),
        Err(e) if e.is_transient() => Err(e),
        Err(e) => {
            warn!("{}: could not count rows, assuming 0: {}", table, e);
            Ok(0)
        }
    }
}

async fn load_chunks(
    conn: &mut dyn TargetConnection,
    table: &TableName,
    dataset: &Dataset,
    types: &ColumnTypeMap,
    batch_size: usize,
) -> Result<u64> {
    let mut loaded = 0u64;
    for (i, chunk) in dataset.chunks(batch_size).enumerate() {
        let inserted = conn
            .bulk_insert(table, dataset.columns(), chunk, types)
            .await?;
        debug!("{}: chunk {} loaded {} rows", table, i + 1, inserted);
        loaded += inserted;
    }
    Ok(loaded)
}
