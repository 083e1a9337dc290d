//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the migration unit, the persisted ledger entry, and the result
//! types reported by the executor.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::cmp::Ordering;

/// One versioned, checksummed SQL change script
///
/// Created once by the loader and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    version: i32,
    description: String,
    script_name: String,
    checksum: String,
    #[serde(skip)]
    sql: String,
}

impl Migration {
    /// Build a migration unit from already-computed parts
    pub fn new(
        version: i32,
        description: impl Into<String>,
        script_name: impl Into<String>,
        checksum: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            script_name: script_name.into(),
            checksum: checksum.into(),
            sql: sql.into(),
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// File name the script was loaded from, stored in the ledger's `script` column
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Lowercase hex SHA-256 of the script body
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl PartialOrd for Migration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Migration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.script_name.cmp(&other.script_name))
    }
}

/// One persisted attempt in the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub version: i32,
    pub description: String,
    pub script: String,
    pub checksum: String,
    pub installed_on: Option<NaiveDateTime>,
    pub success: bool,
}

/// Table names used by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Table holding one row per migration attempt
    pub ledger_table: String,
    /// Table holding the sentinel row targeted by the migration lock
    pub lock_table: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_table: "schema_migration".to_string(),
            lock_table: "migration_lock".to_string(),
        }
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationRunResult {
    /// Number of migrations that were applied
    pub applied_count: usize,
    /// Versions that were applied, in application order
    pub applied_versions: Vec<i32>,
    /// Number of migrations that were skipped (already applied)
    pub skipped_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Migration status relative to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    /// Not yet applied
    Pending,
    /// Applied with the same checksum
    Applied,
    /// Applied, but the script changed since
    ChecksumMismatch {
        /// Checksum stored in the ledger
        recorded: String,
    },
}
