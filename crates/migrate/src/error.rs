//! Error types for the migration engine
//!
//! Run-level failures are reported through [`MigrateError`]. Problems found
//! while discovering scripts are not errors: they are collected as
//! [`DiscoveryWarning`]s and the offending script is left out of the run.

use std::fmt;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors that abort a migration run
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// An already-applied script was edited after it was applied
    #[error("Checksum mismatch for version {version} script {script}. Expected: {expected}, actual: {actual}")]
    ChecksumMismatch {
        version: i32,
        script: String,
        expected: String,
        actual: String,
    },

    /// A statement of a pending script failed to execute
    #[error("Failed to apply migration V{version} ({script}): {reason}")]
    ExecutionFailure {
        version: i32,
        script: String,
        reason: String,
    },

    /// Two scripts in the same run claim the same version
    #[error("Duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: i32,
        first: String,
        second: String,
    },

    /// Database driver or query error
    #[error("Database error: {0}")]
    Database(String),

    /// Error reported by the server, with its SQLSTATE code
    #[error("Database error: {message} (SQLSTATE {code})")]
    Sql { code: String, message: String },

    /// Begin, commit or rollback failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Invalid migrator configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// SQLSTATE `unique_violation`
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE `duplicate_table`
pub const SQLSTATE_DUPLICATE_TABLE: &str = "42P07";

impl MigrateError {
    /// Whether this error signals checksum drift rather than an execution problem
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, MigrateError::ChecksumMismatch { .. })
    }

    /// SQLSTATE reported by the server, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            MigrateError::Sql { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether a `CREATE ... IF NOT EXISTS` lost a race with another transaction
    ///
    /// PostgreSQL reports the loser as a unique violation on its catalog, or as
    /// a duplicate table, once the winner commits.
    pub fn is_concurrent_create(&self) -> bool {
        matches!(
            self.sqlstate(),
            Some(SQLSTATE_UNIQUE_VIOLATION) | Some(SQLSTATE_DUPLICATE_TABLE)
        )
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());

        match code {
            Some(code) => MigrateError::Sql {
                code,
                message: err.to_string(),
            },
            None => MigrateError::Database(err.to_string()),
        }
    }
}

/// Non-fatal problem found while loading migration scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryWarning {
    /// File name does not follow `V<version>__<description>.sql`
    InvalidName { name: String },
    /// Version segment is zero or does not fit the ledger's integer column
    InvalidVersion { name: String, version: String },
    /// Script could not be read or is not valid UTF-8
    Unreadable { name: String, reason: String },
}

impl DiscoveryWarning {
    /// Name of the script this warning is about
    pub fn script_name(&self) -> &str {
        match self {
            DiscoveryWarning::InvalidName { name }
            | DiscoveryWarning::InvalidVersion { name, .. }
            | DiscoveryWarning::Unreadable { name, .. } => name,
        }
    }
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryWarning::InvalidName { name } => {
                write!(f, "Skipping file with invalid migration name: {}", name)
            }
            DiscoveryWarning::InvalidVersion { name, version } => {
                write!(f, "Skipping {}: version '{}' is not a positive 32-bit integer", name, version)
            }
            DiscoveryWarning::Unreadable { name, reason } => {
                write!(f, "Failed to read migration file {}: {}", name, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_is_distinguishable() {
        let drift = MigrateError::ChecksumMismatch {
            version: 1,
            script: "V1__init.sql".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(drift.is_checksum_mismatch());
        assert!(drift.to_string().contains("Checksum mismatch"));

        let failure = MigrateError::ExecutionFailure {
            version: 2,
            script: "V2__seed.sql".to_string(),
            reason: "syntax error".to_string(),
        };
        assert!(!failure.is_checksum_mismatch());
        assert_eq!(failure.to_string(), "Failed to apply migration V2 (V2__seed.sql): syntax error");
    }

    #[test]
    fn test_concurrent_create_recognised_by_sqlstate() {
        for code in [SQLSTATE_UNIQUE_VIOLATION, SQLSTATE_DUPLICATE_TABLE] {
            let err = MigrateError::Sql {
                code: code.to_string(),
                message: "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"".to_string(),
            };
            assert!(err.is_concurrent_create());
            assert_eq!(err.sqlstate(), Some(code));
        }

        let syntax = MigrateError::Sql {
            code: "42601".to_string(),
            message: "syntax error".to_string(),
        };
        assert!(!syntax.is_concurrent_create());
        assert!(syntax.to_string().contains("SQLSTATE 42601"));
        assert!(!MigrateError::Database("connection reset".to_string()).is_concurrent_create());
    }

    #[test]
    fn test_discovery_warning_names_its_script() {
        let warning = DiscoveryWarning::Unreadable {
            name: "V3__broken.sql".to_string(),
            reason: "stream did not contain valid UTF-8".to_string(),
        };
        assert_eq!(warning.script_name(), "V3__broken.sql");
        assert!(warning.to_string().starts_with("Failed to read migration file V3__broken.sql"));
    }
}
