//! Configuration validation.

use super::{AuthMode, Config};
use crate::error::{LoadError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let target = &config.target;

    if target.host.trim().is_empty() {
        return Err(LoadError::Config("target.host is required".into()));
    }
    if target.database.trim().is_empty() {
        return Err(LoadError::Config("target.database is required".into()));
    }
    if target.port == 0 {
        return Err(LoadError::Config("target.port must be non-zero".into()));
    }
    if target.auth == AuthMode::SqlServer && target.user.is_empty() {
        return Err(LoadError::Config(
            "target.user is required for sql_server authentication".into(),
        ));
    }
    if target.max_connections == 0 {
        return Err(LoadError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    if config.upsert.batch_size == 0 {
        return Err(LoadError::Config(
            "upsert.batch_size must be at least 1".into(),
        ));
    }
    if config.upsert.max_retries == 0 {
        return Err(LoadError::Config(
            "upsert.max_retries must be at least 1".into(),
        ));
    }

    Ok(())
}
