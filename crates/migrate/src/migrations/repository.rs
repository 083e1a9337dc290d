//! Migration Repository - Ledger and lock table access
//!
//! Every operation runs against a transaction supplied by the caller; the
//! repository never begins, commits or rolls back on its own.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use super::definitions::{LedgerConfig, LedgerEntry, Migration};
use crate::backends::{MigrationTransaction, SqlValue};
use crate::error::{MigrateError, MigrateResult};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier pattern")
});

/// Sentinel key of the single lock row
pub const LOCK_ROW_ID: i32 = 1;

const SCHEMA_SAVEPOINT: &str = "elif_migrate_schema";

/// Data access for the ledger and lock tables
#[derive(Debug, Clone)]
pub struct MigrationRepository {
    config: LedgerConfig,
}

impl MigrationRepository {
    /// Create a repository, validating the configured table names
    pub fn new(config: LedgerConfig) -> MigrateResult<Self> {
        validate_identifier("ledger table", &config.ledger_table)?;
        validate_identifier("lock table", &config.lock_table)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Create the ledger and lock tables if they do not exist yet
    ///
    /// Runs started together on a fresh database all try to create the tables.
    /// The losers wait in the catalog until the winner commits and then fail;
    /// that failure is rolled back to a savepoint and ignored, since the table
    /// now exists.
    pub async fn ensure_schema_objects(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<()> {
        self.create_if_missing(tx, &self.config.ledger_table, &self.create_ledger_table_sql())
            .await?;
        self.create_if_missing(tx, &self.config.lock_table, &self.create_lock_table_sql())
            .await
    }

    async fn create_if_missing(
        &self,
        tx: &mut dyn MigrationTransaction,
        table: &str,
        create_sql: &str,
    ) -> MigrateResult<()> {
        tx.execute(&format!("SAVEPOINT {}", SCHEMA_SAVEPOINT), &[]).await?;

        match tx.execute(create_sql, &[]).await {
            Ok(_) => {}
            Err(e) if e.is_concurrent_create() => {
                debug!("Table {} was created by a concurrent run: {}", table, e);
                tx.execute(&format!("ROLLBACK TO SAVEPOINT {}", SCHEMA_SAVEPOINT), &[])
                    .await?;
            }
            Err(e) => return Err(e),
        }

        tx.execute(&format!("RELEASE SAVEPOINT {}", SCHEMA_SAVEPOINT), &[])
            .await?;
        Ok(())
    }

    /// Take the exclusive migration lock for the rest of the transaction
    ///
    /// Blocks while another transaction holds the lock row.
    pub async fn acquire_exclusive_lock(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<()> {
        tx.execute(&self.upsert_lock_row_sql(), &[SqlValue::Int(LOCK_ROW_ID)])
            .await?;

        debug!("Waiting for migration lock on {}", self.config.lock_table);
        let rows = tx
            .fetch_all(&self.select_lock_row_sql(), &[SqlValue::Int(LOCK_ROW_ID)])
            .await?;

        if rows.is_empty() {
            return Err(MigrateError::Database(format!(
                "Lock row {} missing from {}",
                LOCK_ROW_ID, self.config.lock_table
            )));
        }

        debug!("Migration lock acquired");
        Ok(())
    }

    /// Map each successfully applied version to its recorded checksum
    ///
    /// Rows are read oldest first, so when several successful rows exist for
    /// one version the most recently installed one wins.
    pub async fn load_applied_checksums(
        &self,
        tx: &mut dyn MigrationTransaction,
    ) -> MigrateResult<BTreeMap<i32, String>> {
        let rows = tx.fetch_all(&self.select_applied_sql(), &[]).await?;

        let mut applied = BTreeMap::new();
        for row in rows {
            applied.insert(row.get_i32(0)?, row.get_string(1)?);
        }
        Ok(applied)
    }

    /// Append one attempt to the ledger, stamped with the current time
    pub async fn record_attempt(
        &self,
        tx: &mut dyn MigrationTransaction,
        migration: &Migration,
        success: bool,
    ) -> MigrateResult<()> {
        let params = [
            SqlValue::Int(migration.version()),
            SqlValue::from(migration.description()),
            SqlValue::from(migration.script_name()),
            SqlValue::from(migration.checksum()),
            SqlValue::Timestamp(Utc::now().naive_utc()),
            SqlValue::Bool(success),
        ];
        tx.execute(&self.insert_attempt_sql(), &params).await?;
        Ok(())
    }

    /// Every ledger row, ordered by version then install time
    pub async fn load_entries(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<Vec<LedgerEntry>> {
        let rows = tx.fetch_all(&self.select_entries_sql(), &[]).await?;

        rows.into_iter()
            .map(|row| {
                Ok(LedgerEntry {
                    version: row.get_i32(0)?,
                    description: row.get_string(1)?,
                    script: row.get_string(2)?,
                    checksum: row.get_string(3)?,
                    installed_on: row.get_optional_timestamp(4)?,
                    success: row.get_bool(5)?,
                })
            })
            .collect()
    }

    /// SQL to create the ledger table
    pub fn create_ledger_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version INTEGER PRIMARY KEY,\n    \
                description VARCHAR(255),\n    \
                script VARCHAR(255),\n    \
                checksum VARCHAR(64),\n    \
                installed_on TIMESTAMP,\n    \
                success BOOLEAN\n\
            )",
            self.config.ledger_table
        )
    }

    /// SQL to create the lock table
    pub fn create_lock_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER PRIMARY KEY\n\
            )",
            self.config.lock_table
        )
    }

    /// SQL to insert the sentinel lock row unless it exists
    pub fn upsert_lock_row_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
            self.config.lock_table
        )
    }

    /// SQL to lock the sentinel row until the transaction ends
    pub fn select_lock_row_sql(&self) -> String {
        format!("SELECT id FROM {} WHERE id = $1 FOR UPDATE", self.config.lock_table)
    }

    /// SQL to read successful attempts
    pub fn select_applied_sql(&self) -> String {
        format!(
            "SELECT version, checksum FROM {} WHERE success = TRUE ORDER BY version, installed_on",
            self.config.ledger_table
        )
    }

    /// SQL to record an attempt
    pub fn insert_attempt_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, description, script, checksum, installed_on, success) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.config.ledger_table
        )
    }

    /// SQL to read the whole ledger
    pub fn select_entries_sql(&self) -> String {
        format!(
            "SELECT version, description, script, checksum, installed_on, success FROM {} \
             ORDER BY version, installed_on",
            self.config.ledger_table
        )
    }
}

impl Default for MigrationRepository {
    fn default() -> Self {
        Self {
            config: LedgerConfig::default(),
        }
    }
}

/// Whether `name` is an unquoted, optionally schema-qualified SQL identifier
pub fn is_valid_table_name(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

fn validate_identifier(field: &str, value: &str) -> MigrateResult<()> {
    if is_valid_table_name(value) {
        Ok(())
    } else {
        Err(MigrateError::Configuration(format!(
            "Invalid {} name '{}': expected an unquoted SQL identifier, optionally schema-qualified",
            field, value
        )))
    }
}
