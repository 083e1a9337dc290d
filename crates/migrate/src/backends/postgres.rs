//! PostgreSQL Backend Implementation
//!
//! Provides the PostgreSQL implementation of the backend traits using sqlx
//! as the underlying database driver.

use std::time::Duration;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Column, PgPool, Postgres, Row, TypeInfo, ValueRef};
use tracing::debug;
use crate::error::{MigrateError, MigrateResult};
use super::core::*;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout: u64,
    /// Applied with `SET LOCAL lock_timeout` at the start of every transaction
    pub lock_timeout: Option<Duration>,
    /// Applied with `SET LOCAL statement_timeout` at the start of every transaction
    pub statement_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: 30,
            lock_timeout: None,
            statement_timeout: None,
        }
    }
}

/// Transaction source backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PostgresSource {
    pool: PgPool,
    config: PoolConfig,
}

impl PostgresSource {
    /// Wrap an existing pool
    pub fn new(pool: PgPool, config: PoolConfig) -> Self {
        Self { pool, config }
    }

    /// Create a pool for `database_url`
    pub async fn connect(database_url: &str, config: PoolConfig) -> MigrateResult<Self> {
        validate_database_url(database_url)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect(database_url)
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to connect to database: {}", e)))?;

        Ok(Self::new(pool, config))
    }

    /// Get the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TransactionSource for PostgresSource {
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Failed to start transaction: {}", e)))?;

        if let Some(timeout) = self.config.lock_timeout {
            let sql = format!("SET LOCAL lock_timeout = {}", timeout.as_millis());
            sqlx::query(&sql).execute(&mut *tx).await?;
            debug!("Transaction lock_timeout set to {:?}", timeout);
        }

        if let Some(timeout) = self.config.statement_timeout {
            let sql = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            sqlx::query(&sql).execute(&mut *tx).await?;
            debug!("Transaction statement_timeout set to {:?}", timeout);
        }

        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }
}

/// PostgreSQL transaction implementation
///
/// The wrapped sqlx transaction rolls back on drop, so an abandoned handle
/// never leaks partial changes.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn inner(&mut self) -> MigrateResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| MigrateError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl MigrationTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        let tx = self.inner()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sql_value(query, param);
        }

        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<SqlRow>> {
        let tx = self.inner()?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sql_value(query, param);
        }

        let rows = query.fetch_all(&mut **tx).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrateError::Transaction("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Failed to commit transaction: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> MigrateResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrateError::Transaction("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| MigrateError::Transaction(format!("Failed to rollback transaction: {}", e)))
    }
}

/// Reject anything that is not a PostgreSQL URL before sqlx sees it
pub fn validate_database_url(url: &str) -> MigrateResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| MigrateError::Configuration(format!("Invalid database URL: {}", e)))?;

    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => Err(MigrateError::Configuration(format!(
            "Unsupported database URL scheme '{}', expected postgres:// or postgresql://",
            other
        ))),
    }
}

/// URL with the password masked, safe for logs
pub fn redact_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid database url>".to_string(),
    }
}

fn bind_sql_value<'a>(
    query: sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments>,
    value: &SqlValue,
) -> sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Timestamp(ts) => query.bind(*ts),
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> MigrateResult<SqlRow> {
    let mut values = Vec::with_capacity(row.len());

    for (index, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(index)?.is_null() {
            values.push(SqlValue::Null);
            continue;
        }

        let value = match column.type_info().name() {
            "BOOL" => SqlValue::Bool(row.try_get(index)?),
            "INT2" => SqlValue::Int(i32::from(row.try_get::<i16, _>(index)?)),
            "INT4" => SqlValue::Int(row.try_get(index)?),
            "INT8" => SqlValue::BigInt(row.try_get(index)?),
            "TIMESTAMP" => SqlValue::Timestamp(row.try_get(index)?),
            "TIMESTAMPTZ" => {
                let ts: chrono::DateTime<chrono::Utc> = row.try_get(index)?;
                SqlValue::Timestamp(ts.naive_utc())
            }
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => SqlValue::Text(row.try_get(index)?),
            other => {
                return Err(MigrateError::Database(format!(
                    "Unsupported column type '{}' for column '{}'",
                    other,
                    column.name()
                )))
            }
        };
        values.push(value);
    }

    Ok(SqlRow::new(values))
}
