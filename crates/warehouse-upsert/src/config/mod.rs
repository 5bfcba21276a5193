//! Configuration loading and validation.
//!
//! Configuration is read once at startup (from YAML or from environment
//! variables), validated, and then passed explicitly to constructors.

mod types;
mod validation;

pub use types::*;

use std::path::Path;
use std::str::FromStr;

use crate::error::{LoadError, Result};

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from process environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `SQL_SERVER` | target.host (`host` or `host,port`) |
    /// | `SQL_PORT` | target.port |
    /// | `SQL_DB` | target.database |
    /// | `SQL_USER` / `SQL_PASSWORD` | SQL Server login |
    /// | `SQL_AUTH` | `sql_server` or `integrated`; integrated when no user is set |
    /// | `SQL_ENCRYPT` / `SQL_TRUST_CERT` | encryption flags |
    /// | `ETL_BATCH_SIZE`, `ETL_MAX_RETRIES`, `ETL_RETRY_BACKOFF_SECS` | upsert settings |
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server = get("SQL_SERVER")
            .ok_or_else(|| LoadError::Config("SQL_SERVER is not set".into()))?;
        let (host, inline_port) = match server.split_once(',') {
            Some((host, port)) => (host.trim().to_string(), Some(parse_var::<u16>("SQL_SERVER", port)?)),
            None => (server.trim().to_string(), None),
        };
        let port = match get("SQL_PORT") {
            Some(p) => parse_var("SQL_PORT", &p)?,
            None => inline_port.unwrap_or_else(default_mssql_port),
        };

        let user = get("SQL_USER").unwrap_or_default();
        let auth = match get("SQL_AUTH").as_deref() {
            Some("sql_server") => AuthMode::SqlServer,
            Some("integrated") => AuthMode::Integrated,
            Some(other) => {
                return Err(LoadError::Config(format!(
                    "SQL_AUTH must be 'sql_server' or 'integrated', got '{}'",
                    other
                )))
            }
            None if user.is_empty() => AuthMode::Integrated,
            None => AuthMode::SqlServer,
        };

        let target = TargetConfig {
            host,
            port,
            database: get("SQL_DB").unwrap_or_default(),
            auth,
            user,
            password: get("SQL_PASSWORD").unwrap_or_default(),
            encrypt: match get("SQL_ENCRYPT") {
                Some(v) => parse_bool("SQL_ENCRYPT", &v)?,
                None => true,
            },
            trust_server_cert: match get("SQL_TRUST_CERT") {
                Some(v) => parse_bool("SQL_TRUST_CERT", &v)?,
                None => false,
            },
            max_connections: default_max_connections(),
        };

        let mut upsert = UpsertConfig::default();
        if let Some(v) = get("ETL_BATCH_SIZE") {
            upsert.batch_size = parse_var("ETL_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("ETL_MAX_RETRIES") {
            upsert.max_retries = parse_var("ETL_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("ETL_RETRY_BACKOFF_SECS") {
            upsert.retry_backoff_secs = parse_var("ETL_RETRY_BACKOFF_SECS", &v)?;
        }

        let config = Config { target, upsert };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl TargetConfig {
    /// `host:port/database` for log lines.
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoadError::Config(format!("{} has an invalid value: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(LoadError::Config(format!(
            "{} must be true or false, got '{}'",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_yaml_applies_defaults() {
        let yaml = r#"
target:
  host: sql01
  database: Warehouse
  user: etl
  password: secret
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.port, 1433);
        assert_eq!(config.target.auth, AuthMode::SqlServer);
        assert!(config.target.encrypt);
        assert_eq!(config.target.max_connections, 4);
        assert_eq!(config.upsert.batch_size, 200);
        assert_eq!(config.upsert.max_retries, 3);
        assert_eq!(config.upsert.retry_backoff().as_secs(), 5);
    }

    #[test]
    fn test_from_yaml_overrides() {
        let yaml = r#"
target:
  host: sql01
  port: 14330
  database: Warehouse
  auth: integrated
upsert:
  batch_size: 500
  max_retries: 5
  retry_backoff_secs: 1
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.port, 14330);
        assert_eq!(config.target.auth, AuthMode::Integrated);
        assert_eq!(config.upsert.batch_size, 500);
        assert_eq!(config.upsert.max_retries, 5);
        assert_eq!(config.target.describe(), "sql01:14330/Warehouse");
    }

    #[test]
    fn test_from_yaml_rejects_unknown_auth() {
        let yaml = "target:\n  host: a\n  database: b\n  auth: kerberos\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_vars_trusted_connection() {
        let config =
            Config::from_vars(vars(&[("SQL_SERVER", "sql01"), ("SQL_DB", "Warehouse")])).unwrap();
        assert_eq!(config.target.host, "sql01");
        assert_eq!(config.target.auth, AuthMode::Integrated);
        assert_eq!(config.upsert.batch_size, 200);
    }

    #[test]
    fn test_from_vars_sql_login_and_inline_port() {
        let config = Config::from_vars(vars(&[
            ("SQL_SERVER", "sql01,14330"),
            ("SQL_DB", "Warehouse"),
            ("SQL_USER", "etl"),
            ("SQL_PASSWORD", "pw"),
            ("ETL_BATCH_SIZE", "1000"),
            ("ETL_MAX_RETRIES", "2"),
            ("ETL_RETRY_BACKOFF_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.target.port, 14330);
        assert_eq!(config.target.auth, AuthMode::SqlServer);
        assert_eq!(config.upsert.batch_size, 1000);
        assert_eq!(config.upsert.max_retries, 2);
        assert_eq!(config.upsert.retry_backoff_secs, 0);
    }

    #[test]
    fn test_from_vars_errors() {
        assert!(Config::from_vars(vars(&[("SQL_DB", "Warehouse")])).is_err());
        assert!(Config::from_vars(vars(&[("SQL_SERVER", "sql01")])).is_err());
        assert!(Config::from_vars(vars(&[
            ("SQL_SERVER", "sql01"),
            ("SQL_DB", "Warehouse"),
            ("ETL_BATCH_SIZE", "lots"),
        ]))
        .is_err());
        assert!(Config::from_vars(vars(&[
            ("SQL_SERVER", "sql01"),
            ("SQL_DB", "Warehouse"),
            ("SQL_AUTH", "kerberos"),
        ]))
        .is_err());
    }
}
