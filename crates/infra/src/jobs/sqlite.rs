//! SQLite-backed job store.
//!
//! ## Concurrency
//!
//! Any number of workers (tasks in this process, or other processes pointed at
//! the same file) may share one database. The operations that must not race
//! (`claim_next_pending`, `promote_retryable`, `retry_dead`) are each a single
//! guarded `UPDATE … RETURNING` statement:
//!
//! - SQLite admits one writer at a time, so the statement's read of the
//!   candidate row and its write happen under the same write lock.
//! - The `WHERE state = '<expected>'` guard acts as a compare-and-swap: a row
//!   that another writer already moved is simply not matched.
//! - The statement runs in a transaction that commits only after every
//!   returned row has decoded, so a corrupt row is never left half-claimed.
//!
//! Contending connections wait on `busy_timeout` instead of failing.
//!
//! ## Timestamps
//!
//! Stored as fixed-width RFC 3339 text (see `queuectl_core::time`), so `<=`
//! and `ORDER BY` on the text columns are chronological.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{Config, Job, JobId, JobState, format_timestamp, parse_timestamp};

use super::store::{ConfigStore, DeadLetterRetry, JobStore, JobStoreError, PersistedConfig};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, next_retry_at, error_message";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: u32 = 8;

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobStoreError::storage(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "opened sqlite job store");
        Ok(store)
    }

    /// Wrap an existing pool. The schema is created if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, JobStoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), JobStoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                command       TEXT NOT NULL,
                state         TEXT NOT NULL,
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_retries   INTEGER NOT NULL DEFAULT 3,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                next_retry_at TEXT NULL,
                error_message TEXT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_next_retry ON jobs(next_retry_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        bind_job(sqlx::query(&sql), job)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id.clone())
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        Ok(())
    }

    async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (id) DO UPDATE SET
                command       = excluded.command,
                state         = excluded.state,
                attempts      = excluded.attempts,
                max_retries   = excluded.max_retries,
                created_at    = excluded.created_at,
                updated_at    = excluded.updated_at,
                next_retry_at = excluded.next_retry_at,
                error_message = excluded.error_message
            "#
        );
        bind_job(sqlx::query(&sql), job)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_state", e))?;
        rows.iter().map(decode_job).collect()
    }

    async fn list_all(&self) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, rowid ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_all", e))?;
        rows.iter().map(decode_job).collect()
    }

    async fn counts_by_state(&self) -> Result<HashMap<JobState, u64>, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts_by_state", e))?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("counts_by_state", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("counts_by_state", e))?;
            let state = state
                .parse::<JobState>()
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            counts.insert(state, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                next_retry_at = NULL,
                updated_at = MAX(updated_at, ?1)
            WHERE state = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let rows = sqlx::query(&sql)
            .bind(format_timestamp(now))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("promote_retryable", e))?;

        // Decode before commit: a bad row rolls the whole batch back.
        let mut promoted = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        // RETURNING order is unspecified.
        promoted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(promoted)
    }

    #[instrument(skip(self), err)]
    async fn claim_next_pending(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                updated_at = MAX(updated_at, ?1)
            WHERE id = (
                    SELECT id FROM jobs
                    WHERE state = 'pending'
                    ORDER BY created_at ASC, rowid ASC
                    LIMIT 1
                )
              AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let row = sqlx::query(&sql)
            .bind(format_timestamp(now))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next_pending", e))?;

        // An undecodable row stays pending: dropping `tx` rolls the claim back.
        let claimed = row.as_ref().map(decode_job).transpose()?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(claimed)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_dead(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterRetry, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                error_message = NULL,
                next_retry_at = NULL,
                updated_at = MAX(updated_at, ?2)
            WHERE id = ?1 AND state = 'dead'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(format_timestamp(now))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("retry_dead", e))?;

        if let Some(row) = row {
            let job = decode_job(&row)?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(DeadLetterRetry::Requeued(job));
        }
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
        Ok(match self.get(id).await? {
            Some(job) => DeadLetterRetry::NotDead(job.state),
            None => DeadLetterRetry::NotFound,
        })
    }

    async fn delete(&self, id: &JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }
}

const CONFIG_MAX_RETRIES: &str = "max_retries";
const CONFIG_BACKOFF_BASE: &str = "backoff_base";
const CONFIG_MAX_BACKOFF_SECS: &str = "max_backoff_secs";

#[async_trait]
impl ConfigStore for SqliteJobStore {
    async fn load_config(&self, defaults: Config) -> Result<Config, JobStoreError> {
        let rows = sqlx::query("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_config", e))?;

        let mut persisted = PersistedConfig::from_config(&defaults);
        for row in rows {
            let key: String = row
                .try_get("key")
                .map_err(|e| map_sqlx_error("load_config", e))?;
            let value: String = row
                .try_get("value")
                .map_err(|e| map_sqlx_error("load_config", e))?;
            match key.as_str() {
                CONFIG_MAX_RETRIES => persisted.max_retries = decode_config_value(&key, &value)?,
                CONFIG_BACKOFF_BASE => persisted.backoff_base = decode_config_value(&key, &value)?,
                CONFIG_MAX_BACKOFF_SECS => {
                    persisted.max_backoff_secs = decode_config_value(&key, &value)?
                }
                // Keys written by newer versions are ignored.
                _ => {}
            }
        }
        Ok(persisted.apply(defaults))
    }

    async fn save_config(&self, config: &Config) -> Result<(), JobStoreError> {
        let persisted = PersistedConfig::from_config(config);
        let entries = [
            (CONFIG_MAX_RETRIES, serde_json::json!(persisted.max_retries)),
            (CONFIG_BACKOFF_BASE, serde_json::json!(persisted.backoff_base)),
            (CONFIG_MAX_BACKOFF_SECS, serde_json::json!(persisted.max_backoff_secs)),
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        for (key, value) in entries {
            sqlx::query(
                r#"
                INSERT INTO config (key, value) VALUES (?1, ?2)
                ON CONFLICT (key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(value.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save_config", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

fn decode_config_value<T: serde::de::DeserializeOwned>(
    key: &str,
    raw: &str,
) -> Result<T, JobStoreError> {
    serde_json::from_str(raw)
        .map_err(|e| JobStoreError::Corrupt(format!("config key '{key}' = '{raw}': {e}")))
}

fn bind_job<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    job: &'q Job,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(job.id.as_str())
        .bind(job.command.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .bind(job.next_retry_at.map(format_timestamp))
        .bind(job.error_message.as_deref())
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    created_at: String,
    updated_at: String,
    next_retry_at: Option<String>,
    error_message: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for JobRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, detail: String| {
            JobStoreError::Corrupt(format!("job {}: {field}: {detail}", row.id))
        };

        let job = Job {
            id: JobId::from(row.id.as_str()),
            command: row.command.clone(),
            state: row
                .state
                .parse()
                .map_err(|e: queuectl_core::DomainError| corrupt("state", e.to_string()))?,
            attempts: u32::try_from(row.attempts)
                .map_err(|e| corrupt("attempts", e.to_string()))?,
            max_retries: u32::try_from(row.max_retries)
                .map_err(|e| corrupt("max_retries", e.to_string()))?,
            created_at: parse_timestamp(&row.created_at)
                .map_err(|e| corrupt("created_at", e.to_string()))?,
            updated_at: parse_timestamp(&row.updated_at)
                .map_err(|e| corrupt("updated_at", e.to_string()))?,
            next_retry_at: row
                .next_retry_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(|e| corrupt("next_retry_at", e.to_string()))?,
            error_message: row.error_message.clone(),
        };
        job.check_invariants()
            .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        Ok(job)
    }
}

fn decode_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let row = <JobRow as sqlx::FromRow<SqliteRow>>::from_row(row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Map sqlx errors to the store's error type, tagging the failing operation.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out waiting for a connection in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
