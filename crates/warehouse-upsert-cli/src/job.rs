//! Job files and delimited report extracts.
//!
//! A job file names the target table, its unique keys and the declared type
//! of each column, plus how to read the extract:
//!
//! ```yaml
//! target: dbo.ZMB51
//! keys: [Article, Site, Date]
//! columns:
//!   - { name: Article, type: nvarchar(20) }
//!   - { name: Site, type: nvarchar(10) }
//!   - { name: Date, type: date }
//!   - { name: Quantity, type: decimal(18,3) }
//! input:
//!   delimiter: "\t"
//!   skip_rows: 2
//!   skip_first_field: true
//!   rename: { "Pstng Date": Date, "Quantity i": Quantity }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};
use warehouse_upsert::{
    AppendRequest, ColumnType, ColumnTypeMap, Dataset, LoadError, Result, SqlValue, TableName,
    UpsertRequest,
};

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// A load job read from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub target: TableName,

    /// Unique-key columns (required for upsert, ignored by append).
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub staging: Option<TableName>,

    #[serde(default)]
    pub batch_size: Option<usize>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Declared columns, in target order.
    pub columns: ColumnTypeMap,

    #[serde(default)]
    pub input: InputFormat,
}

/// How to read a delimited extract.
#[derive(Debug, Clone, Deserialize)]
pub struct InputFormat {
    /// Field separator (default: tab).
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Lines to skip before the header (default: 0).
    #[serde(default)]
    pub skip_rows: usize,

    /// Whether the first line after `skip_rows` names the columns (default: true).
    #[serde(default = "default_true")]
    pub header: bool,

    /// Drop the leading field of every line; SAP list exports start with an empty one.
    #[serde(default)]
    pub skip_first_field: bool,

    /// Field values read as NULL in addition to the empty string.
    #[serde(default)]
    pub null_markers: Vec<String>,

    /// Header name to column name.
    #[serde(default)]
    pub rename: HashMap<String, String>,

    /// Drop rows whose key columns contain NULL instead of loading them.
    #[serde(default)]
    pub drop_null_keys: bool,
}

impl Default for InputFormat {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            skip_rows: 0,
            header: true,
            skip_first_field: false,
            null_markers: Vec::new(),
            rename: HashMap::new(),
            drop_null_keys: false,
        }
    }
}

fn default_delimiter() -> char {
    '\t'
}

fn default_true() -> bool {
    true
}

impl JobSpec {
    /// Load a job file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let job: JobSpec = serde_yaml::from_str(yaml)?;
        if job.columns.is_empty() {
            return Err(LoadError::Config(format!(
                "job for {} declares no columns",
                job.target
            )));
        }
        job.delimiter()?;
        Ok(job)
    }

    pub fn upsert_request(&self) -> UpsertRequest {
        let mut request =
            UpsertRequest::new(self.target.clone(), self.keys.clone(), self.columns.clone());
        request.staging = self.staging.clone();
        request.batch_size = self.batch_size;
        request.max_retries = self.max_retries;
        request
    }

    pub fn append_request(&self) -> AppendRequest {
        let mut request = AppendRequest::new(self.target.clone(), self.columns.clone());
        request.batch_size = self.batch_size;
        request.max_retries = self.max_retries;
        request
    }

    /// Read an extract file into a dataset with the declared columns.
    pub fn read_input(&self, path: &Path) -> Result<Dataset> {
        let content = fs::read_to_string(path)?;
        let dataset = self.parse_input(&content)?;
        info!(
            "Read {} rows from {}",
            dataset.len(),
            path.display()
        );
        Ok(dataset)
    }

    pub fn parse_input(&self, content: &str) -> Result<Dataset> {
        let input = &self.input;
        let columns: Vec<(&str, ColumnType)> = self.columns.iter().collect();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter()?)
            .has_headers(false)
            .flexible(true)
            .from_reader(skip_lines(content, input.skip_rows).as_bytes());
        let mut records = reader.records();

        // Position of each declared column within a record
        let positions: Vec<usize> = if input.header {
            let header = records
                .next()
                .ok_or_else(|| LoadError::InvalidDataset("input has no header line".into()))?
                .map_err(|e| read_error(e, input.skip_rows))?;
            let line_no = line_of(&header, input.skip_rows);
            let names: Vec<String> = self
                .fields(&header)
                .into_iter()
                .map(|h| {
                    let h = h.trim();
                    input.rename.get(h).cloned().unwrap_or_else(|| h.to_string())
                })
                .collect();
            columns
                .iter()
                .map(|(name, _)| {
                    names
                        .iter()
                        .position(|n| n.eq_ignore_ascii_case(name))
                        .ok_or_else(|| {
                            LoadError::InvalidDataset(format!(
                                "line {}: header has no column {:?}",
                                line_no, name
                            ))
                        })
                })
                .collect::<Result<_>>()?
        } else {
            (0..columns.len()).collect()
        };
        let width = positions.iter().max().map_or(0, |m| m + 1);

        let key_positions: Vec<usize> = self
            .keys
            .iter()
            .filter_map(|k| columns.iter().position(|(name, _)| name == k))
            .collect();

        let mut dataset = Dataset::new(columns.iter().map(|(name, _)| *name))?;
        let mut dropped = 0usize;
        for record in records {
            let record = record.map_err(|e| read_error(e, input.skip_rows))?;
            let line_no = line_of(&record, input.skip_rows);
            let fields = self.fields(&record);
            if fields.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            if fields.len() < width {
                return Err(LoadError::InvalidDataset(format!(
                    "line {}: expected at least {} fields, found {}",
                    line_no,
                    width,
                    fields.len()
                )));
            }

            let row = columns
                .iter()
                .zip(&positions)
                .map(|((name, column_type), &pos)| {
                    self.coerce(fields[pos], *column_type).map_err(|e| {
                        LoadError::InvalidDataset(format!("line {}, column {}: {}", line_no, name, e))
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if input.drop_null_keys && key_positions.iter().any(|&i| row[i].is_null()) {
                dropped += 1;
                continue;
            }
            dataset.push_row(row)?;
        }

        if dropped > 0 {
            warn!("Dropped {} rows with a NULL key column", dropped);
        }
        debug!("Parsed {} rows for {}", dataset.len(), self.target);
        Ok(dataset)
    }

    fn delimiter(&self) -> Result<u8> {
        let delimiter = self.input.delimiter;
        if !delimiter.is_ascii() {
            return Err(LoadError::Config(format!(
                "input delimiter {:?} must be a single ASCII character",
                delimiter
            )));
        }
        Ok(delimiter as u8)
    }

    fn fields<'r>(&self, record: &'r csv::StringRecord) -> Vec<&'r str> {
        let skip = usize::from(self.input.skip_first_field);
        record.iter().skip(skip).collect()
    }

    /// Convert one raw field to a value of the declared type.
    fn coerce(&self, raw: &str, column_type: ColumnType) -> std::result::Result<SqlValue, String> {
        let field = raw.trim();
        if field.is_empty() || self.input.null_markers.iter().any(|m| m == field) {
            return Ok(SqlValue::Null);
        }

        match column_type {
            ColumnType::NVarChar(_) | ColumnType::VarChar(_) | ColumnType::Text => {
                Ok(SqlValue::Text(field.to_string()))
            }
            ColumnType::Integer => {
                let number = normalize_number(field);
                let value = i64::from_str(&number)
                    .map_err(|_| format!("cannot parse {:?} as INT", raw))?;
                Ok(match i32::try_from(value) {
                    Ok(v) => SqlValue::I32(v),
                    Err(_) => SqlValue::I64(value),
                })
            }
            ColumnType::Decimal { .. } => {
                let number = normalize_number(field);
                Decimal::from_str(&number)
                    .map(SqlValue::Decimal)
                    .map_err(|_| format!("cannot parse {:?} as {}", raw, column_type))
            }
            ColumnType::Date => parse_date(field)
                .map(SqlValue::Date)
                .ok_or_else(|| format!("cannot parse {:?} as DATE", raw)),
            ColumnType::DateTime => parse_datetime(field)
                .map(SqlValue::DateTime)
                .ok_or_else(|| format!("cannot parse {:?} as DATETIME", raw)),
        }
    }
}

/// Remainder of `content` after its first `count` lines.
fn skip_lines(content: &str, count: usize) -> &str {
    let mut rest = content;
    for _ in 0..count {
        match rest.find('\n') {
            Some(end) => rest = &rest[end + 1..],
            None => return "",
        }
    }
    rest
}

/// 1-based line number of a record in the original file.
fn line_of(record: &csv::StringRecord, skipped: usize) -> u64 {
    record.position().map_or(0, |p| p.line()) + skipped as u64
}

fn read_error(err: csv::Error, skipped: usize) -> LoadError {
    match err.position() {
        Some(pos) => LoadError::InvalidDataset(format!(
            "line {}: {}",
            pos.line() + skipped as u64,
            err
        )),
        None => LoadError::InvalidDataset(err.to_string()),
    }
}

/// Strip thousands separators and move an SAP trailing minus to the front.
fn normalize_number(field: &str) -> String {
    let cleaned: String = field.chars().filter(|c| *c != ',').collect();
    match cleaned.strip_suffix('-') {
        Some(digits) if !digits.is_empty() && !digits.starts_with('-') => format!("-{}", digits),
        _ => cleaned,
    }
}

fn parse_date(field: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(field, fmt).ok())
}

fn parse_datetime(field: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(field, fmt).ok())
        .or_else(|| parse_date(field).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Move a processed extract into `dir`, creating it if needed.
pub fn archive(input: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name = input.file_name().ok_or_else(|| {
        LoadError::Config(format!("{} is not a file path", input.display()))
    })?;
    let destination = dir.join(file_name);
    if fs::rename(input, &destination).is_err() {
        // rename fails across filesystems
        fs::copy(input, &destination)?;
        fs::remove_file(input)?;
    }
    info!("Archived {} to {}", input.display(), destination.display());
    Ok(destination)
}
