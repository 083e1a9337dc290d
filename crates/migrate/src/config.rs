//! Migrator configuration loaded from the environment

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::backends::postgres::{validate_database_url, PoolConfig};
use crate::migrations::definitions::LedgerConfig;
use crate::migrations::repository::is_valid_table_name;

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Settings for a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorConfig {
    pub database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub ledger_table: String,
    pub lock_table: String,
    pub lock_timeout_secs: Option<u64>,
    pub statement_timeout_secs: Option<u64>,
    pub max_connections: u32,
    pub log_level: String,
}

impl MigratorConfig {
    pub fn new() -> Self {
        let ledger = LedgerConfig::default();
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("db/migration"),
            ledger_table: ledger.ledger_table,
            lock_table: ledger.lock_table,
            lock_timeout_secs: None,
            statement_timeout_secs: None,
            max_connections: PoolConfig::default().max_connections,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());

        if let Some(dir) = lookup("MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }
        if let Some(table) = lookup("MIGRATION_LEDGER_TABLE") {
            config.ledger_table = table;
        }
        if let Some(table) = lookup("MIGRATION_LOCK_TABLE") {
            config.lock_table = table;
        }
        if let Some(secs) = lookup("MIGRATION_LOCK_TIMEOUT_SECS") {
            config.lock_timeout_secs = Some(parse_number("lock_timeout_secs", &secs)?);
        }
        if let Some(secs) = lookup("MIGRATION_STATEMENT_TIMEOUT_SECS") {
            config.statement_timeout_secs = Some(parse_number("statement_timeout_secs", &secs)?);
        }
        if let Some(max) = lookup("MIGRATION_MAX_CONNECTIONS") {
            config.max_connections = parse_number("max_connections", &max)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, table) in [("ledger_table", &self.ledger_table), ("lock_table", &self.lock_table)] {
            if !is_valid_table_name(table) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: table.clone(),
                    expected: "an unquoted SQL identifier, optionally schema-qualified".to_string(),
                });
            }
        }

        if let Some(url) = &self.database_url {
            if validate_database_url(url).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: "database_url".to_string(),
                    value: crate::backends::postgres::redact_database_url(url),
                    expected: "a postgres:// or postgresql:// URL".to_string(),
                });
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.log_level.clone(),
                expected: format!("one of: {}", VALID_LOG_LEVELS.join(", ")),
            });
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections".to_string(),
                value: "0".to_string(),
                expected: "at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// The database URL, required by commands that touch the database
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "database_url".to_string(),
                hint: "Set DATABASE_URL or pass --database-url".to_string(),
            })
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ledger_table: self.ledger_table.clone(),
            lock_table: self.lock_table.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            lock_timeout: self.lock_timeout_secs.map(Duration::from_secs),
            statement_timeout: self.statement_timeout_secs.map(Duration::from_secs),
            ..PoolConfig::default()
        }
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        expected: "a non-negative integer".to_string(),
    })
}
