//! In-memory backend for unit tests
//!
//! Understands exactly the SQL issued by [`MigrationRepository`] and treats
//! every other statement as opaque migration SQL, which is logged and becomes
//! visible only on commit. It mirrors the PostgreSQL behaviour the engine
//! relies on: a real blocking row lock, savepoints, and a transaction that
//! refuses further commands after a failed statement until it is rolled back
//! to a savepoint.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

use crate::backends::{MigrationTransaction, SqlRow, SqlValue, TransactionSource};
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::{LedgerConfig, LedgerEntry};
use crate::migrations::repository::MigrationRepository;

#[derive(Debug, Default)]
struct State {
    ledger: Vec<LedgerEntry>,
    statements: Vec<String>,
    discarded_ledger: Vec<LedgerEntry>,
    failing_markers: Vec<String>,
    schema_failures: Vec<String>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

struct Shared {
    repository: MigrationRepository,
    state: Mutex<State>,
    row_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Shared in-memory database; clones refer to the same data
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                repository: MigrationRepository::new(config).expect("valid ledger config"),
                state: Mutex::new(State::default()),
                row_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().expect("state lock")
    }

    /// Make any migration statement containing `marker` fail
    pub fn fail_on(&self, marker: &str) {
        self.state().failing_markers.push(marker.to_string());
    }

    /// Make the next `CREATE TABLE` of a ledger or lock table fail with `sqlstate`
    ///
    /// Each call queues one failure, consumed in order.
    pub fn fail_next_create(&self, sqlstate: &str) {
        self.state().schema_failures.push(sqlstate.to_string());
    }

    /// Committed ledger rows
    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.state().ledger.clone()
    }

    /// Ledger rows written by transactions that were rolled back
    pub fn discarded_ledger(&self) -> Vec<LedgerEntry> {
        self.state().discarded_ledger.clone()
    }

    /// Committed migration statements, in execution order
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn seed_ledger_row(&self, entry: LedgerEntry) {
        self.state().ledger.push(entry);
    }

    /// Overwrite the recorded checksum of `version`, as an out-of-band edit would
    pub fn tamper_checksum(&self, version: i32, checksum: &str) -> usize {
        let mut state = self.state();
        let mut updated = 0;
        for entry in state.ledger.iter_mut().filter(|e| e.version == version) {
            entry.checksum = checksum.to_string();
            updated += 1;
        }
        updated
    }

    pub fn begin_count(&self) -> usize {
        self.state().begins
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.state().rollbacks
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionSource for MemoryDatabase {
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        self.state().begins += 1;
        Ok(Box::new(MemoryTransaction {
            db: self.clone(),
            ledger: Vec::new(),
            statements: Vec::new(),
            savepoints: Vec::new(),
            lock_guard: None,
            aborted: false,
        }))
    }
}

struct MemoryTransaction {
    db: MemoryDatabase,
    ledger: Vec<LedgerEntry>,
    statements: Vec<String>,
    savepoints: Vec<(String, usize, usize)>,
    lock_guard: Option<OwnedMutexGuard<()>>,
    aborted: bool,
}

impl MemoryTransaction {
    fn repository(&self) -> &MigrationRepository {
        &self.db.shared.repository
    }

    fn check_not_aborted(&self) -> MigrateResult<()> {
        if self.aborted {
            return Err(MigrateError::Database(
                "current transaction is aborted, commands ignored until end of transaction block".to_string(),
            ));
        }
        Ok(())
    }

    fn fail(&mut self, message: String) -> MigrateError {
        self.aborted = true;
        MigrateError::Database(message)
    }

    fn visible_ledger(&self) -> Vec<LedgerEntry> {
        let mut rows = self.db.ledger();
        rows.extend(self.ledger.iter().cloned());
        rows.sort_by(|a, b| (a.version, a.installed_on).cmp(&(b.version, b.installed_on)));
        rows
    }

    fn insert_attempt(&mut self, params: &[SqlValue]) -> MigrateResult<u64> {
        let entry = match params {
            [version, description, script, checksum, installed_on, success] => LedgerEntry {
                version: version.as_i32().unwrap_or_default(),
                description: description.as_str().unwrap_or_default().to_string(),
                script: script.as_str().unwrap_or_default().to_string(),
                checksum: checksum.as_str().unwrap_or_default().to_string(),
                installed_on: installed_on.as_timestamp(),
                success: success.as_bool().unwrap_or_default(),
            },
            _ => return Err(self.fail(format!("expected 6 parameters, got {}", params.len()))),
        };

        if self.visible_ledger().iter().any(|e| e.version == entry.version) {
            return Err(self.fail(format!(
                "duplicate key value violates unique constraint on version {}",
                entry.version
            )));
        }

        self.ledger.push(entry);
        Ok(1)
    }

    fn run_statement(&mut self, sql: &str) -> MigrateResult<u64> {
        let failing = self
            .db
            .state()
            .failing_markers
            .iter()
            .any(|marker| sql.contains(marker.as_str()));

        if failing {
            return Err(self.fail(format!("syntax error in statement: {}", sql)));
        }

        self.statements.push(sql.to_string());
        Ok(0)
    }
}

#[async_trait]
impl MigrationTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let position = self
                .savepoints
                .iter()
                .rposition(|(sp, _, _)| sp == name)
                .ok_or_else(|| MigrateError::Database(format!("savepoint \"{}\" does not exist", name)))?;
            let (_, ledger_len, statements_len) = self.savepoints[position].clone();
            self.savepoints.truncate(position + 1);
            self.ledger.truncate(ledger_len);
            self.statements.truncate(statements_len);
            self.aborted = false;
            return Ok(0);
        }

        self.check_not_aborted()?;

        if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            self.savepoints
                .push((name.to_string(), self.ledger.len(), self.statements.len()));
            return Ok(0);
        }

        if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            let position = self
                .savepoints
                .iter()
                .rposition(|(sp, _, _)| sp == name)
                .ok_or_else(|| MigrateError::Database(format!("savepoint \"{}\" does not exist", name)))?;
            self.savepoints.truncate(position);
            return Ok(0);
        }

        let repo = self.repository();
        if sql == repo.create_ledger_table_sql() || sql == repo.create_lock_table_sql() {
            let queued = {
                let mut state = self.db.state();
                if state.schema_failures.is_empty() {
                    None
                } else {
                    Some(state.schema_failures.remove(0))
                }
            };
            if let Some(code) = queued {
                self.aborted = true;
                return Err(MigrateError::Sql {
                    code,
                    message: "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"".to_string(),
                });
            }
            return Ok(0);
        }
        if sql == repo.upsert_lock_row_sql() {
            return Ok(0);
        }
        if sql == repo.insert_attempt_sql() {
            return self.insert_attempt(params);
        }

        self.run_statement(sql)
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>> {
        self.check_not_aborted()?;

        let repo = self.repository().clone();
        if sql == repo.select_lock_row_sql() {
            if self.lock_guard.is_none() {
                let guard = self.db.shared.row_lock.clone().lock_owned().await;
                self.lock_guard = Some(guard);
            }
            return Ok(vec![SqlRow::new(vec![SqlValue::Int(1)])]);
        }

        if sql == repo.select_applied_sql() {
            return Ok(self
                .visible_ledger()
                .into_iter()
                .filter(|e| e.success)
                .map(|e| SqlRow::new(vec![SqlValue::Int(e.version), SqlValue::Text(e.checksum)]))
                .collect());
        }

        if sql == repo.select_entries_sql() {
            return Ok(self
                .visible_ledger()
                .into_iter()
                .map(|e| {
                    SqlRow::new(vec![
                        SqlValue::Int(e.version),
                        SqlValue::Text(e.description),
                        SqlValue::Text(e.script),
                        SqlValue::Text(e.checksum),
                        e.installed_on.map(SqlValue::Timestamp).unwrap_or(SqlValue::Null),
                        SqlValue::Bool(e.success),
                    ])
                })
                .collect());
        }

        Err(MigrateError::Database(format!("unsupported query in memory backend: {}", sql)))
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        if self.aborted {
            return Err(MigrateError::Transaction("cannot commit an aborted transaction".to_string()));
        }

        let mut state = self.db.state();
        state.ledger.extend(self.ledger.iter().cloned());
        state.statements.extend(self.statements.iter().cloned());
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        let mut state = self.db.state();
        state.discarded_ledger.extend(self.ledger.iter().cloned());
        state.rollbacks += 1;
        Ok(())
    }
}
