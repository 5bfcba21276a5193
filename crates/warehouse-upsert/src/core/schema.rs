//! Column type descriptors and the ordered column type map.
//!
//! [`ColumnType`] is the closed set of types the loader can provision. Each
//! descriptor renders to a SQL Server type literal; descriptors outside the
//! supported bounds, and literals that name any other type, are rejected with
//! [`LoadError::UnsupportedType`] instead of being guessed at.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Largest declarable NVARCHAR length (characters).
const NVARCHAR_MAX_LENGTH: u32 = 4000;

/// Largest declarable VARCHAR length (bytes).
const VARCHAR_MAX_LENGTH: u32 = 8000;

/// Largest DECIMAL precision.
const DECIMAL_MAX_PRECISION: u8 = 38;

/// Largest DECIMAL scale the bulk encoder can carry (rust_decimal's limit).
const DECIMAL_MAX_SCALE: u8 = 28;

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// Unicode string with a maximum length in characters.
    NVarChar(u32),

    /// Non-Unicode string with a maximum length in bytes.
    VarChar(u32),

    /// Unbounded Unicode text, `NVARCHAR(MAX)`.
    Text,

    /// 32-bit integer.
    Integer,

    /// Fixed-point decimal.
    Decimal { precision: u8, scale: u8 },

    /// Calendar date.
    Date,

    /// Date and time of day.
    DateTime,
}

impl ColumnType {
    /// Render the SQL Server type literal, validating bounds.
    pub fn render(&self) -> Result<String> {
        match *self {
            ColumnType::NVarChar(len) if len == 0 || len > NVARCHAR_MAX_LENGTH => {
                Err(LoadError::UnsupportedType(format!(
                    "NVARCHAR length must be 1..={} (got {})",
                    NVARCHAR_MAX_LENGTH, len
                )))
            }
            ColumnType::VarChar(len) if len == 0 || len > VARCHAR_MAX_LENGTH => {
                Err(LoadError::UnsupportedType(format!(
                    "VARCHAR length must be 1..={} (got {})",
                    VARCHAR_MAX_LENGTH, len
                )))
            }
            ColumnType::Decimal { precision, scale }
                if precision == 0 || precision > DECIMAL_MAX_PRECISION || scale > precision =>
            {
                Err(LoadError::UnsupportedType(format!(
                    "DECIMAL({}, {}) needs precision 1..={} and scale <= precision",
                    precision, scale, DECIMAL_MAX_PRECISION
                )))
            }
            ColumnType::Decimal { precision, scale } if scale > DECIMAL_MAX_SCALE => {
                Err(LoadError::UnsupportedType(format!(
                    "DECIMAL({}, {}) scale must be <= {}",
                    precision, scale, DECIMAL_MAX_SCALE
                )))
            }
            _ => Ok(self.to_string()),
        }
    }

}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::NVarChar(len) => write!(f, "NVARCHAR({})", len),
            ColumnType::VarChar(len) => write!(f, "VARCHAR({})", len),
            ColumnType::Text => f.write_str("NVARCHAR(MAX)"),
            ColumnType::Integer => f.write_str("INT"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "DECIMAL({}, {})", precision, scale)
            }
            ColumnType::Date => f.write_str("DATE"),
            ColumnType::DateTime => f.write_str("DATETIME"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = LoadError;

    /// Parse a type literal such as `nvarchar(20)` or `decimal(18, 2)`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let unsupported = || LoadError::UnsupportedType(s.to_string());

        let (base, args) = match normalized.find('(') {
            Some(open) if normalized.ends_with(')') => (
                &normalized[..open],
                Some(&normalized[open + 1..normalized.len() - 1]),
            ),
            Some(_) => return Err(unsupported()),
            None => (normalized.as_str(), None),
        };

        let parsed = match (base, args) {
            ("text" | "ntext", None) | ("nvarchar", Some("max")) => ColumnType::Text,
            ("nvarchar", Some(len)) => ColumnType::NVarChar(len.parse().map_err(|_| unsupported())?),
            ("varchar", Some(len)) => ColumnType::VarChar(len.parse().map_err(|_| unsupported())?),
            ("int" | "integer", None) => ColumnType::Integer,
            ("decimal" | "numeric", Some(args)) => {
                let mut parts = args.split(',');
                let precision = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(unsupported)?;
                let scale = match parts.next() {
                    Some(s) => s.parse().map_err(|_| unsupported())?,
                    None => 0,
                };
                if parts.next().is_some() {
                    return Err(unsupported());
                }
                ColumnType::Decimal { precision, scale }
            }
            ("date", None) => ColumnType::Date,
            ("datetime", None) => ColumnType::DateTime,
            _ => return Err(unsupported()),
        };

        parsed.render()?;
        Ok(parsed)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// One `name: type` entry as written in job files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Ordered mapping from column name to [`ColumnType`].
///
/// Order matters: it is the column order of a provisioned target table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ColumnSpec>", into = "Vec<ColumnSpec>")]
pub struct ColumnTypeMap {
    entries: Vec<(String, ColumnType)>,
}

impl ColumnTypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a column; a replaced column keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, column_type: ColumnType) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = column_type,
            None => self.entries.push((name, column_type)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.insert(name, column_type);
        self
    }

    pub fn get(&self, name: &str) -> Option<ColumnType> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<ColumnSpec>> for ColumnTypeMap {
    fn from(specs: Vec<ColumnSpec>) -> Self {
        let mut map = ColumnTypeMap::new();
        for spec in specs {
            map.insert(spec.name, spec.column_type);
        }
        map
    }
}

impl From<ColumnTypeMap> for Vec<ColumnSpec> {
    fn from(map: ColumnTypeMap) -> Self {
        map.entries
            .into_iter()
            .map(|(name, column_type)| ColumnSpec { name, column_type })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, ColumnType)> for ColumnTypeMap {
    fn from_iter<I: IntoIterator<Item = (S, ColumnType)>>(iter: I) -> Self {
        let mut map = ColumnTypeMap::new();
        for (name, column_type) in iter {
            map.insert(name, column_type);
        }
        map
    }
}
