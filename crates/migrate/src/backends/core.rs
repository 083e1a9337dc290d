//! Core Database Backend Traits
//!
//! The migration engine never opens connections itself. It asks a
//! [`TransactionSource`] for a [`MigrationTransaction`] and runs every ledger
//! query and migration statement through that handle. Parameters use
//! PostgreSQL-style positional placeholders (`$1`, `$2`, ...).

use async_trait::async_trait;
use chrono::NaiveDateTime;
use crate::error::{MigrateError, MigrateResult};

/// Factory for transactional database handles
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Begin a new transaction with manual commit control
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>>;
}

/// An open database transaction
///
/// Dropping a handle without calling [`commit`](Self::commit) must discard
/// every change made through it.
#[async_trait]
pub trait MigrationTransaction: Send {
    /// Execute a statement and return the affected rows count
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64>;

    /// Execute a query and return all result rows
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

/// Database value for parameter binding and row decoding
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i32),
    BigInt(i64),
    Text(String),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::BigInt(i) => i32::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(i64::from(*i)),
            SqlValue::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

/// A result row, columns in select-list order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Get a column value by index
    pub fn get(&self, index: usize) -> MigrateResult<&SqlValue> {
        self.values.get(index).ok_or_else(|| {
            MigrateError::Database(format!(
                "Column index {} out of range ({} columns)",
                index,
                self.values.len()
            ))
        })
    }

    pub fn get_i32(&self, index: usize) -> MigrateResult<i32> {
        let value = self.get(index)?;
        value.as_i32().ok_or_else(|| unexpected_type(index, "integer", value))
    }

    pub fn get_i64(&self, index: usize) -> MigrateResult<i64> {
        let value = self.get(index)?;
        value.as_i64().ok_or_else(|| unexpected_type(index, "bigint", value))
    }

    pub fn get_string(&self, index: usize) -> MigrateResult<String> {
        let value = self.get(index)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected_type(index, "text", value))
    }

    pub fn get_bool(&self, index: usize) -> MigrateResult<bool> {
        let value = self.get(index)?;
        value.as_bool().ok_or_else(|| unexpected_type(index, "boolean", value))
    }

    /// Timestamp columns may be NULL in hand-edited ledgers
    pub fn get_optional_timestamp(&self, index: usize) -> MigrateResult<Option<NaiveDateTime>> {
        let value = self.get(index)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_timestamp()
            .map(Some)
            .ok_or_else(|| unexpected_type(index, "timestamp", value))
    }

    /// Get column count
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn unexpected_type(index: usize, expected: &str, actual: &SqlValue) -> MigrateError {
    MigrateError::Database(format!(
        "Column {} expected {}, found {:?}",
        index, expected, actual
    ))
}
