//! Migration Executor - Applies pending migrations in one transaction
//!
//! A run takes the exclusive migration lock, compares the supplied units with
//! the ledger, applies whatever is pending in version order and commits once.
//! Any failure rolls the whole run back, so a run either lands completely or
//! leaves the database as it found it.

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::definitions::{Migration, MigrationRunResult, MigrationState};
use super::loader::split_statements;
use super::repository::MigrationRepository;
use crate::backends::{MigrationTransaction, TransactionSource};
use crate::error::{MigrateError, MigrateResult};

const APPLY_SAVEPOINT: &str = "elif_migrate_apply";

/// Migration executor that applies migrations against a database
pub struct MigrationExecutor<S> {
    source: S,
    repository: MigrationRepository,
}

impl<S: TransactionSource> MigrationExecutor<S> {
    /// Create an executor using the default ledger and lock tables
    pub fn new(source: S) -> Self {
        Self::with_repository(source, MigrationRepository::default())
    }

    pub fn with_repository(source: S, repository: MigrationRepository) -> Self {
        Self { source, repository }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    /// Apply every pending migration as a single unit of work
    ///
    /// Units are applied in ascending version order whatever order they are
    /// passed in. Two units sharing a version are rejected before the
    /// database is touched.
    pub async fn migrate(&self, migrations: &[Migration]) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();
        let ordered = ordered_by_version(migrations)?;

        let mut tx = self.source.begin().await?;

        match self.run(tx.as_mut(), &ordered).await {
            Ok(mut result) => {
                tx.commit().await?;
                result.execution_time_ms = start_time.elapsed().as_millis();
                info!(
                    "All migrations committed successfully ({} applied, {} skipped)",
                    result.applied_count, result.skipped_count
                );
                Ok(result)
            }
            Err(e) => {
                error!("Migration failed: {}", e);
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Rollback after failed migration also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Report the state of each unit against the ledger without changing anything
    pub async fn status(&self, migrations: &[Migration]) -> MigrateResult<Vec<(Migration, MigrationState)>> {
        let ordered = ordered_by_version(migrations)?;

        let mut tx = self.source.begin().await?;
        let applied = self.snapshot(tx.as_mut()).await;
        if let Err(e) = tx.rollback().await {
            warn!("Failed to release status transaction: {}", e);
        }
        let applied = applied?;

        Ok(ordered
            .into_iter()
            .map(|migration| {
                let state = match applied.get(&migration.version()) {
                    None => MigrationState::Pending,
                    Some(recorded) if recorded == migration.checksum() => MigrationState::Applied,
                    Some(recorded) => MigrationState::ChecksumMismatch {
                        recorded: recorded.clone(),
                    },
                };
                (migration.clone(), state)
            })
            .collect())
    }

    async fn snapshot(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<BTreeMap<i32, String>> {
        self.repository.ensure_schema_objects(tx).await?;
        self.repository.load_applied_checksums(tx).await
    }

    async fn run(
        &self,
        tx: &mut dyn MigrationTransaction,
        ordered: &[&Migration],
    ) -> MigrateResult<MigrationRunResult> {
        self.repository.ensure_schema_objects(tx).await?;
        self.repository.acquire_exclusive_lock(tx).await?;

        let mut applied = self.repository.load_applied_checksums(tx).await?;
        let mut result = MigrationRunResult::default();

        for migration in ordered {
            let version = migration.version();

            if let Some(existing) = applied.get(&version) {
                if existing != migration.checksum() {
                    return Err(MigrateError::ChecksumMismatch {
                        version,
                        script: migration.script_name().to_string(),
                        expected: existing.clone(),
                        actual: migration.checksum().to_string(),
                    });
                }
                info!("Skipping already applied migration V{} ({})", version, migration.script_name());
                result.skipped_count += 1;
                continue;
            }

            info!("Applying migration V{} ({}) ...", version, migration.script_name());
            self.apply_single(tx, migration).await?;
            applied.insert(version, migration.checksum().to_string());
            result.applied_versions.push(version);
        }

        result.applied_count = result.applied_versions.len();
        Ok(result)
    }

    /// Run one unit's statements and record the outcome
    ///
    /// The statements run inside a savepoint so that, on failure, the
    /// transaction is usable again for recording the failed attempt.
    async fn apply_single(&self, tx: &mut dyn MigrationTransaction, migration: &Migration) -> MigrateResult<()> {
        let version = migration.version();
        tx.execute(&format!("SAVEPOINT {}", APPLY_SAVEPOINT), &[]).await?;

        match execute_statements(tx, migration).await {
            Ok(()) => {
                tx.execute(&format!("RELEASE SAVEPOINT {}", APPLY_SAVEPOINT), &[]).await?;
                self.repository.record_attempt(tx, migration, true).await?;
                info!("Migration V{} applied successfully", version);
                Ok(())
            }
            Err(e) => {
                error!("Migration V{} failed: {}", version, e);

                if let Err(record_err) = self.record_failure(tx, migration).await {
                    warn!("Could not record failed attempt for V{}: {}", version, record_err);
                }

                Err(MigrateError::ExecutionFailure {
                    version,
                    script: migration.script_name().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn record_failure(&self, tx: &mut dyn MigrationTransaction, migration: &Migration) -> MigrateResult<()> {
        tx.execute(&format!("ROLLBACK TO SAVEPOINT {}", APPLY_SAVEPOINT), &[]).await?;
        self.repository.record_attempt(tx, migration, false).await
    }
}

async fn execute_statements(tx: &mut dyn MigrationTransaction, migration: &Migration) -> MigrateResult<()> {
    for (index, statement) in split_statements(migration.sql()).iter().enumerate() {
        debug!("V{} statement {}: {}", migration.version(), index + 1, statement);
        tx.execute(statement, &[]).await?;
    }
    Ok(())
}

/// Sort units by version, rejecting versions claimed twice
fn ordered_by_version(migrations: &[Migration]) -> MigrateResult<Vec<&Migration>> {
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by_key(|m| m.version());

    for pair in ordered.windows(2) {
        if pair[0].version() == pair[1].version() {
            return Err(MigrateError::DuplicateVersion {
                version: pair[0].version(),
                first: pair[0].script_name().to_string(),
                second: pair[1].script_name().to_string(),
            });
        }
    }

    Ok(ordered)
}
