//! SQLite persistence for bucket/object metadata and the task outbox.
//!
//! Query functions are generic over [`SqliteExecutor`] so the same statement
//! runs against the pool or inside a [`UnitOfWork`].

pub mod buckets;
pub mod objects;
pub mod tasks;

use chrono::{DateTime, Utc};
use sqlx::{
    SqliteConnection, SqlitePool, Transaction,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use uuid::Uuid;

use crate::models::task::TaskPayload;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Open a connection pool, creating the database file if needed.
///
/// WAL lets readers proceed while a unit of work holds the write lock.
pub async fn connect(database_url: &str, max_connections: u32) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn migrate(pool: &SqlitePool) -> sqlx::Result<()> {
    let statements = schema_statements(SCHEMA);
    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .map(str::trim)
        .filter(|s| {
            s.lines()
                .any(|line| !line.trim().is_empty() && !line.trim_start().starts_with("--"))
        })
        .collect()
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// One atomic unit of work: metadata reads, writes, and task scheduling that
/// commit together or not at all.
///
/// Dropping the unit without calling [`UnitOfWork::commit`] rolls it back,
/// which is also what happens when the owning request future is cancelled.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    /// Units read before they write, so they take the write lock up front.
    /// A deferred `BEGIN` would fail with `SQLITE_BUSY` on the lock upgrade
    /// instead of waiting out the busy timeout.
    pub async fn begin(pool: &SqlitePool) -> sqlx::Result<Self> {
        Ok(Self {
            tx: pool.begin_with("BEGIN IMMEDIATE").await?,
        })
    }

    /// Connection bound to this transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Enqueue `payload` in the outbox, due at `run_at`. The task becomes
    /// visible to workers only if this unit commits.
    pub async fn schedule(
        &mut self,
        payload: &TaskPayload,
        run_at: DateTime<Utc>,
    ) -> sqlx::Result<Uuid> {
        tasks::insert(&mut *self.tx, payload, run_at).await
    }

    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
    use std::path::Path;

    /// Fresh in-memory database with the schema applied.
    ///
    /// A single connection that never idles out keeps the in-memory database
    /// alive for the whole test.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        super::migrate(&pool).await.expect("apply schema");
        pool
    }

    /// File-backed database under `dir` with several connections, for tests
    /// that exercise concurrent units of work.
    pub async fn file_pool(dir: &Path) -> SqlitePool {
        let url = format!("sqlite://{}", dir.join("meta.db").display());
        let pool = super::connect(&url, 5).await.expect("open sqlite file");
        super::migrate(&pool).await.expect("apply schema");
        pool
    }
}
