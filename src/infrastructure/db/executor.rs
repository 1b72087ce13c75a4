//! Read-only statement execution.
//!
//! The executor only ever sees SQL that already passed `QueryValidator`.
//! It still owns the last-resort row ceiling and the timeout: each statement
//! is wrapped in an outer bounded select and a statement that outlives
//! `query_timeout_secs` is dropped and reported, never retried.

use crate::domain::error::{AppError, ExecutionErrorKind, Result};
use crate::domain::resolved_query::QueryResult;
use crate::infrastructure::config::DatabaseConfig;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor as _, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[async_trait]
pub trait SqlExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult>;
}

/// Wrap `sql` so the database itself stops after `max_rows + 1` rows.
/// The extra row is how truncation is detected.
pub fn bounded_sql(sql: &str, max_rows: usize) -> String {
    let inner = sql.trim().trim_end_matches(';').trim_end();
    format!(
        "SELECT * FROM ({}) AS bounded_result LIMIT {}",
        inner,
        max_rows + 1
    )
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// Map a driver error onto the execution taxonomy.
pub fn classify_error(err: &sqlx::Error) -> ExecutionErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ExecutionErrorKind::Connection,
        sqlx::Error::ColumnNotFound(_) => ExecutionErrorKind::Schema,
        sqlx::Error::Database(db) => {
            let code = db.code();
            let message = db.message().to_lowercase();
            // 42703 undefined_column, 42P01 undefined_table
            if matches!(code.as_deref(), Some("42703") | Some("42P01"))
                || message.contains("no such column")
                || message.contains("no such table")
            {
                ExecutionErrorKind::Schema
            } else {
                ExecutionErrorKind::Other
            }
        }
        _ => ExecutionErrorKind::Other,
    }
}

fn execution_error(err: sqlx::Error) -> AppError {
    let kind = classify_error(&err);
    warn!("Query execution failed ({:?}): {}", kind, err);
    AppError::execution(kind, format!("Query execution failed: {}", err))
}

fn timeout_error(secs: u64) -> AppError {
    warn!("Query timed out after {} seconds", secs);
    AppError::execution(
        ExecutionErrorKind::Timeout,
        format!("Query timed out after {} seconds", secs),
    )
}

fn finish(
    columns: Vec<String>,
    mut rows: Vec<HashMap<String, Value>>,
    max_rows: usize,
    started: Instant,
) -> QueryResult {
    let truncated = rows.len() > max_rows;
    rows.truncate(max_rows);
    info!(
        "Query returned {} rows in {:?}{}",
        rows.len(),
        started.elapsed(),
        if truncated { " (truncated)" } else { "" }
    );
    QueryResult {
        columns,
        row_count: rows.len(),
        rows,
        truncated,
    }
}

pub struct PostgresExecutor {
    pool: PgPool,
    query_timeout_secs: u64,
    max_rows: usize,
}

impl PostgresExecutor {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| {
                AppError::execution(
                    ExecutionErrorKind::Connection,
                    format!("Failed to connect to PostgreSQL: {}", e),
                )
            })?;
        info!("PostgreSQL pool ready ({} connections max)", config.max_connections);
        Ok(Self::from_pool(pool, config))
    }

    pub fn from_pool(pool: PgPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            query_timeout_secs: config.query_timeout_secs,
            max_rows: config.max_rows,
        }
    }

    fn extract_column_value(row: &PgRow, index: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
            return v
                .and_then(|n| serde_json::Number::from_f64(n as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
            return v
                .map(|dt| Value::String(dt.to_rfc3339()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
            return v
                .map(|dt| Value::String(dt.to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
            return v
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null);
        }
        Value::Null
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let bounded = bounded_sql(sql, self.max_rows);
        debug!("Executing bounded statement on PostgreSQL");

        let rows = tokio::time::timeout(
            Duration::from_secs(self.query_timeout_secs),
            sqlx::query(&bounded).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| timeout_error(self.query_timeout_secs))?
        .map_err(execution_error)?;

        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            // no row to read names from; ask the driver for the statement's shape
            None => match (&self.pool).describe(&bounded).await {
                Ok(described) => column_names(described.columns()),
                Err(err) => {
                    warn!(error = %err, "Could not describe empty result");
                    Vec::new()
                }
            },
        };
        let rows_json = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), Self::extract_column_value(row, i)))
                    .collect()
            })
            .collect();

        Ok(finish(columns, rows_json, self.max_rows, started))
    }
}

pub struct SqliteExecutor {
    pool: SqlitePool,
    query_timeout_secs: u64,
    max_rows: usize,
}

impl SqliteExecutor {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        // Every connection to `:memory:` is its own database, so an in-memory
        // pool must hold exactly one connection for its whole life.
        let in_memory = config.url.contains(":memory:");
        let mut options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { config.max_connections })
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| {
                AppError::Configuration(format!("Failed to parse connection string: {}", e))
            })?
            .create_if_missing(true);
        let pool = options.connect_with(connect_options).await.map_err(|e| {
            AppError::execution(
                ExecutionErrorKind::Connection,
                format!("Failed to open SQLite database: {}", e),
            )
        })?;
        info!("SQLite pool ready at {}", config.url);
        Ok(Self::from_pool(pool, config))
    }

    pub fn from_pool(pool: SqlitePool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            query_timeout_secs: config.query_timeout_secs,
            max_rows: config.max_rows,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn extract_column_value(row: &SqliteRow, index: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        Value::Null
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let bounded = bounded_sql(sql, self.max_rows);
        debug!("Executing bounded statement on SQLite");

        let rows = tokio::time::timeout(
            Duration::from_secs(self.query_timeout_secs),
            sqlx::query(&bounded).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| timeout_error(self.query_timeout_secs))?
        .map_err(execution_error)?;

        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            // no row to read names from; ask the driver for the statement's shape
            None => match (&self.pool).describe(&bounded).await {
                Ok(described) => column_names(described.columns()),
                Err(err) => {
                    warn!(error = %err, "Could not describe empty result");
                    Vec::new()
                }
            },
        };
        let rows_json = rows
            .iter()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), Self::extract_column_value(row, i)))
                    .collect()
            })
            .collect();

        Ok(finish(columns, rows_json, self.max_rows, started))
    }
}

/// Pick the executor from the URL scheme.
pub async fn connect(config: &DatabaseConfig) -> Result<std::sync::Arc<dyn SqlExecutor + Send + Sync>> {
    if config.url.starts_with("postgres://") || config.url.starts_with("postgresql://") {
        Ok(std::sync::Arc::new(PostgresExecutor::connect(config).await?))
    } else if config.url.starts_with("sqlite:") {
        Ok(std::sync::Arc::new(SqliteExecutor::connect(config).await?))
    } else {
        Err(AppError::Configuration(format!(
            "Unsupported database url scheme: {}",
            config.url.split(':').next().unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(max_rows: usize) -> SqliteExecutor {
        let config = DatabaseConfig {
            max_rows,
            ..DatabaseConfig::default()
        };
        let executor = SqliteExecutor::connect(&config).await.unwrap();
        sqlx::query("CREATE TABLE suppliers (id INTEGER PRIMARY KEY, name TEXT, spend REAL)")
            .execute(executor.pool())
            .await
            .unwrap();
        for (id, name, spend) in [(1, "Acme", 10.5), (2, "Globex", 99.0), (3, "Initech", 42.0)] {
            sqlx::query("INSERT INTO suppliers (id, name, spend) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(spend)
                .execute(executor.pool())
                .await
                .unwrap();
        }
        executor
    }

    #[test]
    fn test_bounded_sql_strips_terminator() {
        assert_eq!(
            bounded_sql("SELECT a FROM t;  ", 10),
            "SELECT * FROM (SELECT a FROM t) AS bounded_result LIMIT 11"
        );
    }

    #[tokio::test]
    async fn test_execute_returns_typed_values() {
        let executor = seeded(100).await;
        let result = executor
            .execute("SELECT id, name, spend FROM suppliers ORDER BY spend DESC")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name", "spend"]);
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
        assert_eq!(result.rows[0]["name"], Value::String("Globex".into()));
        assert_eq!(result.rows[0]["id"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let executor = seeded(10).await;
        let result = executor
            .execute("SELECT id, name FROM suppliers WHERE spend > 1000")
            .await
            .unwrap();
        assert_eq!(result.row_count, 0);
        assert_eq!(result.columns, vec!["id", "name"]);
    }

    #[tokio::test]
    async fn test_row_ceiling_truncates() {
        let executor = seeded(2).await;
        let result = executor.execute("SELECT id FROM suppliers").await.unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_unknown_column_is_schema_error() {
        let executor = seeded(10).await;
        let err = executor
            .execute("SELECT missing_col FROM suppliers")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Execution {
                kind: ExecutionErrorKind::Schema,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_configuration_error() {
        let config = DatabaseConfig {
            url: "mysql://localhost/db".into(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(connect(&config).await, Err(AppError::Configuration(_))));
    }
}
