//! SQLite bootstrap. The schema is applied idempotently on connect so
//! tests and the daemon see the same database shape.

use sqlx::migrate::MigrateDatabase;
use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;

/// Connect to the SQLite database at `database_url`, creating the file and
/// schema if they don't exist yet.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    if !sqlx::Sqlite::database_exists(database_url).await? {
        debug!(database_url, "Creating SQLite database");
        sqlx::Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePool::connect(database_url).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recurring_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL UNIQUE,
            plugin_name TEXT NOT NULL,
            name TEXT NOT NULL,
            schedule TEXT NOT NULL,
            on_success TEXT NOT NULL DEFAULT 'archive_new',
            metadata TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run TEXT,
            next_run TEXT,
            run_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            plugin_name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            success INTEGER NOT NULL,
            sources_found INTEGER NOT NULL DEFAULT 0,
            sources_archived INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            metadata TEXT,
            scheduled_job_id INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS ix_recurring_jobs_plugin_name ON recurring_jobs (plugin_name)",
        "CREATE INDEX IF NOT EXISTS ix_recurring_jobs_next_run ON recurring_jobs (next_run)",
        "CREATE INDEX IF NOT EXISTS ix_job_executions_job_id ON job_executions (job_id)",
        "CREATE INDEX IF NOT EXISTS ix_job_executions_started_at ON job_executions (started_at DESC)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
