//! # elif-migrate: Versioned SQL migrations
//!
//! Applies `V<version>__<description>.sql` scripts to PostgreSQL exactly once,
//! in version order, inside a single transaction guarded by a row-level
//! migration lock. Applied scripts are checksummed so later edits are
//! detected instead of silently ignored.
//!
//! ```no_run
//! use elif_migrate::{MigrationExecutor, MigrationLoader, PoolConfig, PostgresSource};
//!
//! # async fn run() -> elif_migrate::MigrateResult<()> {
//! let discovery = MigrationLoader::new().load_dir(std::path::Path::new("db/migration"));
//! let source = PostgresSource::connect("postgres://localhost/app", PoolConfig::default()).await?;
//! let result = MigrationExecutor::new(source).migrate(&discovery.migrations).await?;
//! println!("applied {} migration(s)", result.applied_count);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod migrations;

#[cfg(test)]
mod test_support;

pub use backends::{MigrationTransaction, PoolConfig, PostgresSource, SqlRow, SqlValue, TransactionSource};
pub use config::{ConfigError, MigratorConfig};
pub use error::{DiscoveryWarning, MigrateError, MigrateResult};
pub use migrations::*;
