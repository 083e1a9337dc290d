//! Database Backends
//!
//! Transactional handle abstraction consumed by the migration engine, and
//! its PostgreSQL implementation.

pub mod core;
pub mod postgres;

pub use self::core::{MigrationTransaction, SqlRow, SqlValue, TransactionSource};
pub use self::postgres::{PoolConfig, PostgresSource, PostgresTransaction};
