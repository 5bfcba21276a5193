//! SQL Server target: bb8-pooled tiberius connections.

use std::borrow::Cow;
use std::time::Instant;

use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use serde::Serialize;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, ToSql, TokenRow};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use super::{ConnectionProvider, TargetConnection};
use crate::config::{AuthMode, TargetConfig};
use crate::core::{quote_mssql, ColumnType, ColumnTypeMap, SqlValue, TableName};
use crate::dialect::Statement;
use crate::error::{LoadError, Result};

/// Maximum string length (in bytes) for TDS bulk insert.
/// Tiberius bulk insert has a hard limit of 65535 bytes for UTF-16 encoded strings.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// SQL Server rejects statements with more than 2100 parameters.
const MAX_PARAMS_PER_STATEMENT: usize = 2100;

/// DATETIME time-of-day resolution is 1/300 second.
const DATETIME_TICKS_PER_DAY: u64 = 300 * 86_400;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: TargetConfig,
}

impl TiberiusConnectionManager {
    fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> std::result::Result<Config, tiberius::error::Error> {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.application_name("warehouse-upsert");

        match self.config.auth {
            AuthMode::SqlServer => {
                config.authentication(AuthMethod::sql_server(
                    &self.config.user,
                    &self.config.password,
                ));
            }
            #[cfg(windows)]
            AuthMode::Integrated => {
                config.authentication(AuthMethod::Integrated);
            }
            #[cfg(not(windows))]
            AuthMode::Integrated => {
                return Err(tiberius::error::Error::Conversion(
                    "integrated authentication is only available on Windows".into(),
                ));
            }
        }

        if self.config.encrypt {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::Off);
        }
        if self.config.trust_server_cert {
            config.trust_cert();
        }

        Ok(config)
    }
}

#[async_trait]
impl ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config()?;
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Result of [`MssqlProvider::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    /// Whether a round-trip to the server succeeded.
    pub connected: bool,

    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,

    /// `@@VERSION` first line, when connected.
    pub server_version: Option<String>,

    /// Failure description, when not connected.
    pub error: Option<String>,
}

/// SQL Server connection provider.
///
/// Connections are pooled; [`dispose`](ConnectionProvider::dispose) replaces the
/// pool so that the next [`acquire`](ConnectionProvider::acquire) dials a fresh
/// connection instead of reusing one that may have been severed.
pub struct MssqlProvider {
    pool: RwLock<Pool<TiberiusConnectionManager>>,
    config: TargetConfig,
}

impl MssqlProvider {
    /// Create the pool and verify that the server answers.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .build(TiberiusConnectionManager::new(config.clone()))
            .await
            .map_err(|e| LoadError::pool(e, "creating SQL Server pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| LoadError::pool(e, "testing SQL Server connection"))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!("Connected to SQL Server: {}", config.describe());

        Ok(Self {
            pool: RwLock::new(pool),
            config: config.clone(),
        })
    }

    /// Build a provider without dialing; the first acquisition connects.
    pub fn lazy(config: &TargetConfig) -> Self {
        Self {
            pool: RwLock::new(Self::unchecked_pool(config)),
            config: config.clone(),
        }
    }

    fn unchecked_pool(config: &TargetConfig) -> Pool<TiberiusConnectionManager> {
        Pool::builder()
            .max_size(config.max_connections)
            .build_unchecked(TiberiusConnectionManager::new(config.clone()))
    }

    /// Run a version query and report connectivity and latency.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let outcome = self.server_version().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(version) => HealthCheckResult {
                connected: true,
                latency_ms,
                server_version: Some(version),
                error: None,
            },
            Err(e) => HealthCheckResult {
                connected: false,
                latency_ms,
                server_version: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Dials a dedicated connection so an unreachable server fails fast
    /// instead of waiting out the pool's acquisition timeout.
    async fn server_version(&self) -> Result<String> {
        let manager = TiberiusConnectionManager::new(self.config.clone());
        let mut conn = manager.connect().await?;
        let row = conn
            .simple_query("SELECT @@VERSION")
            .await?
            .into_row()
            .await?;
        let version = row
            .and_then(|r| r.get::<&str, _>(0).map(|s| s.to_string()))
            .unwrap_or_default();
        Ok(version.lines().next().unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl ConnectionProvider for MssqlProvider {
    async fn acquire(&self) -> Result<Box<dyn TargetConnection>> {
        let pool = self.pool.read().await.clone();
        let conn = pool
            .get_owned()
            .await
            .map_err(|e| LoadError::pool(e, "acquiring SQL Server connection"))?;
        Ok(Box::new(MssqlConnection { conn }))
    }

    async fn dispose(&self) {
        let mut pool = self.pool.write().await;
        *pool = Self::unchecked_pool(&self.config);
        debug!("Disposed SQL Server pool for {}", self.config.describe());
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

/// One pooled SQL Server connection.
pub struct MssqlConnection {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
}

impl MssqlConnection {
    async fn run(&mut self, table: &TableName, what: &str, sql: &str) -> Result<u64> {
        debug!("{}: {}", what, sql);
        let result = self
            .conn
            .execute(sql, &[])
            .await
            .map_err(|e| LoadError::statement(table.to_string(), what, e))?;
        Ok(result.total())
    }

    /// Check if a row contains any string values that exceed the bulk insert limit.
    fn row_has_oversized_strings(row: &[SqlValue]) -> bool {
        row.iter().any(|value| match value {
            // len_utf16() counts code units; surrogate pairs count twice
            SqlValue::Text(s) => s.chars().map(|c| c.len_utf16() * 2).sum::<usize>() > BULK_INSERT_STRING_LIMIT,
            _ => false,
        })
    }

    /// Stream rows through the TDS bulk-load protocol.
    ///
    /// Rows must already be in the table's physical column order.
    async fn bulk_load(
        &mut self,
        table: &TableName,
        types: &[ColumnType],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        let qualified = table.quoted();
        let mut bulk_load = self
            .conn
            .bulk_insert(&qualified)
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "bulk insert init", e))?;

        for row in rows {
            let mut token_row = TokenRow::new();
            for (value, column_type) in row.iter().zip(types) {
                token_row.push(encode_column_data(value, *column_type)?);
            }
            bulk_load
                .send(token_row)
                .await
                .map_err(|e| LoadError::statement(table.to_string(), "bulk insert send", e))?;
        }

        let result = bulk_load
            .finalize()
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "bulk insert finalize", e))?;

        debug!(
            "Bulk inserted {} rows into {} (reported: {})",
            rows.len(),
            table,
            result.total()
        );
        Ok(rows.len() as u64)
    }

    /// Insert rows using parameterized multi-row INSERT statements.
    async fn insert_rows_fallback(
        &mut self,
        table: &TableName,
        columns: &[String],
        types: &[ColumnType],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let col_list = columns
            .iter()
            .map(|c| quote_mssql(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let max_rows_per_batch = (MAX_PARAMS_PER_STATEMENT / columns.len()).max(1);
        let mut total_inserted = 0u64;

        for batch in rows.chunks(max_rows_per_batch) {
            let mut value_groups = Vec::with_capacity(batch.len());
            let mut param_idx = 1;
            for _ in batch {
                let placeholders: Vec<String> = (0..columns.len())
                    .map(|_| {
                        let p = format!("@P{}", param_idx);
                        param_idx += 1;
                        p
                    })
                    .collect();
                value_groups.push(format!("({})", placeholders.join(", ")));
            }

            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table.quoted(),
                col_list,
                value_groups.join(", ")
            );

            let mut params: Vec<Box<dyn ToSql>> = Vec::with_capacity(batch.len() * columns.len());
            for row in batch {
                for (value, column_type) in row.iter().zip(types) {
                    params.push(encode_param(value, *column_type)?);
                }
            }
            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

            self.conn
                .execute(sql.as_str(), &param_refs)
                .await
                .map_err(|e| {
                    LoadError::statement(
                        table.to_string(),
                        &format!("batched INSERT ({} rows)", batch.len()),
                        e,
                    )
                })?;

            total_inserted += batch.len() as u64;
        }

        debug!(
            "Inserted {} rows into {} via batched INSERT (batch size: {})",
            total_inserted, table, max_rows_per_batch
        );
        Ok(total_inserted)
    }
}

#[async_trait]
impl TargetConnection for MssqlConnection {
    async fn begin(&mut self) -> Result<()> {
        // XACT_ABORT makes any runtime error doom the whole transaction
        self.conn
            .simple_query("SET XACT_ABORT ON; BEGIN TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn
            .simple_query("COMMIT TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn
            .simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        let query = "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES \
                     WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2";
        let row = self
            .conn
            .query(query, &[&table.schema(), &table.name()])
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "checking table", e))?
            .into_row()
            .await?;
        let count: i32 = row.and_then(|r| r.get(0)).unwrap_or(0);
        Ok(count > 0)
    }

    async fn table_columns(&mut self, table: &TableName) -> Result<Vec<String>> {
        let query = "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                     WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
                     ORDER BY ORDINAL_POSITION";
        let rows = self
            .conn
            .query(query, &[&table.schema(), &table.name()])
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "listing columns", e))?
            .into_first_result()
            .await?;

        rows.iter()
            .map(|row| {
                row.get::<&str, _>(0)
                    .map(|s| s.to_string())
                    .ok_or_else(|| LoadError::Statement {
                        table: table.to_string(),
                        message: "missing column name".into(),
                        transient: false,
                    })
            })
            .collect()
    }

    async fn row_count(&mut self, table: &TableName) -> Result<i64> {
        let sql = format!("SELECT CAST(COUNT(*) AS BIGINT) FROM {}", table.quoted());
        let row = self
            .conn
            .simple_query(sql)
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "counting rows", e))?
            .into_row()
            .await
            .map_err(|e| LoadError::statement(table.to_string(), "counting rows", e))?;
        Ok(row.and_then(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let sql = statement.render()?;
        self.run(statement.table(), statement.kind(), &sql).await
    }

    async fn bulk_insert(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        types: &ColumnTypeMap,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_types = columns
            .iter()
            .map(|c| {
                types.get(c).ok_or_else(|| LoadError::MissingColumnType {
                    table: table.to_string(),
                    column: c.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // The bulk-load protocol sends every physical column in table order.
        // When the table has columns the dataset lacks, name columns explicitly.
        let physical = self.table_columns(table).await?;
        let order: Option<Vec<usize>> = if physical.len() == columns.len() {
            physical
                .iter()
                .map(|p| columns.iter().position(|c| c.eq_ignore_ascii_case(p)))
                .collect()
        } else {
            None
        };

        let Some(order) = order else {
            debug!(
                "{} has columns outside the dataset; loading via INSERT",
                table
            );
            return self
                .insert_rows_fallback(table, columns, &column_types, rows)
                .await;
        };

        let ordered_types: Vec<ColumnType> = order.iter().map(|&i| column_types[i]).collect();
        let mut bulk_rows = Vec::with_capacity(rows.len());
        let mut oversized_rows = Vec::new();
        for row in rows {
            if Self::row_has_oversized_strings(row) {
                oversized_rows.push(row.clone());
            } else {
                bulk_rows.push(order.iter().map(|&i| row[i].clone()).collect::<Vec<_>>());
            }
        }

        let mut total_inserted = 0u64;
        if !bulk_rows.is_empty() {
            total_inserted += self.bulk_load(table, &ordered_types, &bulk_rows).await?;
        }
        if !oversized_rows.is_empty() {
            debug!(
                "Falling back to INSERT for {} rows with oversized strings in {}",
                oversized_rows.len(),
                table
            );
            total_inserted += self
                .insert_rows_fallback(table, columns, &column_types, &oversized_rows)
                .await?;
        }

        Ok(total_inserted)
    }
}

fn type_mismatch(value: &SqlValue, column_type: ColumnType) -> LoadError {
    LoadError::InvalidDataset(format!(
        "value {} cannot be stored in a {} column",
        value, column_type
    ))
}

fn days_since(date: NaiveDate, epoch: NaiveDate) -> i64 {
    (date - epoch).num_days()
}

fn to_i32(value: &SqlValue, column_type: ColumnType) -> Result<Option<i32>> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::I32(v) => Ok(Some(*v)),
        SqlValue::I64(v) => i32::try_from(*v)
            .map(Some)
            .map_err(|_| type_mismatch(value, column_type)),
        _ => Err(type_mismatch(value, column_type)),
    }
}

/// Decimal rescaled to the column scale so the wire value matches the column.
fn to_decimal(value: &SqlValue, column_type: ColumnType, scale: u8) -> Result<Option<Decimal>> {
    let mut decimal = match value {
        SqlValue::Null => return Ok(None),
        SqlValue::Decimal(d) => *d,
        SqlValue::I32(v) => Decimal::from(*v),
        SqlValue::I64(v) => Decimal::from(*v),
        SqlValue::F64(v) if v.is_finite() => {
            Decimal::try_from(*v).map_err(|_| type_mismatch(value, column_type))?
        }
        SqlValue::F64(_) => {
            warn!("Converting F64 NaN/Infinity to NULL for SQL Server compatibility");
            return Ok(None);
        }
        _ => return Err(type_mismatch(value, column_type)),
    };
    decimal.rescale(u32::from(scale));
    // rescale lowers the scale instead of overflowing the 96-bit mantissa
    if decimal.scale() != u32::from(scale) {
        return Err(LoadError::InvalidDataset(format!(
            "value {} cannot be represented at scale {} in a {} column",
            value, scale, column_type
        )));
    }
    Ok(Some(decimal))
}

fn to_date(value: &SqlValue, column_type: ColumnType) -> Result<Option<NaiveDate>> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Date(d) => Ok(Some(*d)),
        SqlValue::DateTime(dt) => Ok(Some(dt.date())),
        _ => Err(type_mismatch(value, column_type)),
    }
}

fn to_datetime(value: &SqlValue, column_type: ColumnType) -> Result<Option<NaiveDateTime>> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::DateTime(dt) => Ok(Some(*dt)),
        SqlValue::Date(d) => Ok(d.and_hms_opt(0, 0, 0)),
        _ => Err(type_mismatch(value, column_type)),
    }
}

fn to_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Text(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert a value to Tiberius ColumnData for the declared column type.
fn encode_column_data(value: &SqlValue, column_type: ColumnType) -> Result<ColumnData<'static>> {
    let data = match column_type {
        ColumnType::NVarChar(_) | ColumnType::VarChar(_) | ColumnType::Text => {
            ColumnData::String(to_text(value).map(Cow::Owned))
        }
        ColumnType::Integer => ColumnData::I32(to_i32(value, column_type)?),
        ColumnType::Decimal { scale, .. } => ColumnData::Numeric(
            to_decimal(value, column_type, scale)?
                .map(|d| tiberius::numeric::Numeric::new_with_scale(d.mantissa(), scale)),
        ),
        ColumnType::Date => {
            // DATE is stored as days since 0001-01-01
            let epoch = NaiveDate::from_ymd_opt(1, 1, 1).ok_or_else(|| type_mismatch(value, column_type))?;
            let days = match to_date(value, column_type)? {
                Some(d) => {
                    let days = days_since(d, epoch);
                    Some(u32::try_from(days).map_err(|_| type_mismatch(value, column_type))?)
                }
                None => None,
            };
            ColumnData::Date(days.map(tiberius::time::Date::new))
        }
        ColumnType::DateTime => {
            // DATETIME is days since 1900-01-01 plus 1/300 second ticks
            let epoch =
                NaiveDate::from_ymd_opt(1900, 1, 1).ok_or_else(|| type_mismatch(value, column_type))?;
            let encoded = match to_datetime(value, column_type)? {
                Some(dt) => {
                    let mut days = i32::try_from(days_since(dt.date(), epoch))
                        .map_err(|_| type_mismatch(value, column_type))?;
                    let time = dt.time();
                    let nanos = u64::from(time.num_seconds_from_midnight()) * 1_000_000_000
                        + u64::from(time.nanosecond() % 1_000_000_000);
                    let mut ticks = (nanos * 3 + 5_000_000) / 10_000_000;
                    // rounding can land exactly on midnight of the next day
                    if ticks >= DATETIME_TICKS_PER_DAY {
                        ticks -= DATETIME_TICKS_PER_DAY;
                        days = days
                            .checked_add(1)
                            .ok_or_else(|| type_mismatch(value, column_type))?;
                    }
                    Some(tiberius::time::DateTime::new(days, ticks as u32))
                }
                None => None,
            };
            ColumnData::DateTime(encoded)
        }
    };
    Ok(data)
}

/// Convert a value to a boxed ToSql for parameterized INSERT.
fn encode_param(value: &SqlValue, column_type: ColumnType) -> Result<Box<dyn ToSql>> {
    let param: Box<dyn ToSql> = match column_type {
        ColumnType::NVarChar(_) | ColumnType::VarChar(_) | ColumnType::Text => {
            Box::new(to_text(value))
        }
        ColumnType::Integer => Box::new(to_i32(value, column_type)?),
        ColumnType::Decimal { scale, .. } => Box::new(to_decimal(value, column_type, scale)?),
        ColumnType::Date => Box::new(to_date(value, column_type)?),
        ColumnType::DateTime => Box::new(to_datetime(value, column_type)?),
    };
    Ok(param)
}
