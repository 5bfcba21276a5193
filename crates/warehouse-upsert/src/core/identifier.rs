//! Identifier validation and quoting for SQL Server statements.
//!
//! Table and column names reach this crate from job files written by hand,
//! so they are never trusted. Identifiers cannot be bound as parameters;
//! instead every name is validated and then bracket-quoted with closing
//! brackets doubled before it is spliced into a statement.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// SQL Server's `sysname` limit.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Schema used when a table name carries no schema part.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Suffix appended to the target name to derive its staging table.
pub const STAGING_SUFFIX: &str = "_stg";

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding 128 characters
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LoadError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(LoadError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(LoadError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("Article")?, "[Article]");
/// assert_eq!(quote_mssql("odd]name")?, "[odd]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote a value as an N'...' string literal.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// A `schema.name` table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: String,
    name: String,
}

impl TableName {
    /// Build a table name from its parts, validating both.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();
        validate_identifier(&schema)?;
        validate_identifier(&name)?;
        Ok(Self { schema, name })
    }

    /// Parse `schema.table` or a bare `table` (placed in `dbo`).
    ///
    /// Surrounding brackets on either part are accepted and stripped.
    pub fn parse(qualified: &str) -> Result<Self> {
        let trimmed = qualified.trim();
        match split_qualified(trimmed) {
            Some((schema, name)) => Self::new(unbracket(schema), unbracket(name)),
            None => Self::new(DEFAULT_SCHEMA, unbracket(trimmed)),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[schema].[name]` for use inside statements.
    pub fn quoted(&self) -> String {
        // Both parts were validated on construction.
        format!(
            "[{}].[{}]",
            self.schema.replace(']', "]]"),
            self.name.replace(']', "]]")
        )
    }

    /// Default staging table: same schema, `<name>_stg`.
    pub fn staging(&self) -> Result<Self> {
        Self::new(self.schema.clone(), format!("{}{}", self.name, STAGING_SUFFIX))
    }

    /// Name of the primary key constraint created during provisioning.
    pub fn primary_key_name(&self) -> String {
        format!("PK_{}_{}", self.schema, self.name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl TryFrom<String> for TableName {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for TableName {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split on the first dot that is not inside brackets.
fn split_qualified(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
            _ => {}
        }
    }
    None
}

fn unbracket(part: &str) -> String {
    let part = part.trim();
    if part.len() >= 2 && part.starts_with('[') && part.ends_with(']') {
        part[1..part.len() - 1].replace("]]", "]")
    } else {
        part.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_mssql_escapes_brackets() {
        assert_eq!(quote_mssql("Article").unwrap(), "[Article]");
        assert_eq!(quote_mssql("Amount LC").unwrap(), "[Amount LC]");
        assert_eq!(quote_mssql("a]b").unwrap(), "[a]]b]");
        assert_eq!(
            quote_mssql("x]; DROP TABLE users; --").unwrap(),
            "[x]]; DROP TABLE users; --]"
        );
    }

    #[test]
    fn test_validate_identifier_rejects_bad_names() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
        assert!(validate_identifier("Art. Doc.").is_ok());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("dbo"), "N'dbo'");
        assert_eq!(quote_literal("o'brien"), "N'o''brien'");
    }

    #[test]
    fn test_parse_qualified_and_bare() {
        let t = TableName::parse("dbo.ZMB51").unwrap();
        assert_eq!(t.schema(), "dbo");
        assert_eq!(t.name(), "ZMB51");

        let t = TableName::parse("ZRSSALE").unwrap();
        assert_eq!(t.schema(), DEFAULT_SCHEMA);
        assert_eq!(t.to_string(), "dbo.ZRSSALE");

        let t = TableName::parse("[sales].[Store.RP]").unwrap();
        assert_eq!(t.schema(), "sales");
        assert_eq!(t.name(), "Store.RP");
        assert_eq!(t.quoted(), "[sales].[Store.RP]");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("dbo.").is_err());
        assert!(TableName::parse(".ZMB51").is_err());
    }

    #[test]
    fn test_staging_and_pk_names() {
        let t = TableName::parse("dbo.ZMB51").unwrap();
        assert_eq!(t.staging().unwrap().to_string(), "dbo.ZMB51_stg");
        assert_eq!(t.primary_key_name(), "PK_dbo_ZMB51");
    }

    #[test]
    fn test_quoted_escapes_closing_bracket() {
        let t = TableName::new("dbo", "odd]name").unwrap();
        assert_eq!(t.quoted(), "[dbo].[odd]]name]");
    }

    #[test]
    fn test_serde_as_string() {
        let t: TableName = serde_yaml::from_str("dbo.StoreRP").unwrap();
        assert_eq!(t.name(), "StoreRP");
        let back = serde_yaml::to_string(&t).unwrap();
        assert!(back.contains("dbo.StoreRP"));
    }
}
