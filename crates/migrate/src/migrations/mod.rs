//! Migration System
//!
//! Discovery of versioned SQL scripts, the ledger of applied attempts, and
//! the executor that applies pending scripts under the migration lock.

pub mod definitions;
pub mod executor;
pub mod loader;
pub mod repository;

pub use definitions::*;
pub use executor::MigrationExecutor;
pub use loader::{checksum, create_migration, parse_script_name, split_statements, Discovery, MigrationLoader};
pub use repository::{MigrationRepository, LOCK_ROW_ID};
