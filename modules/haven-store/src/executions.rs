//! Append-only job execution history.
//!
//! Records keep the plugin name denormalized and survive job deletion as
//! orphans; `scheduled_job_id` carries the surrogate key of the job row at
//! record time, when one still exists.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use haven_common::{JobExecution, Metadata};

use crate::{Result, StoreError};

/// A persisted execution row.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub scheduled_job_id: Option<i64>,
    pub execution: JobExecution,
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: i64,
    job_id: String,
    plugin_name: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    success: bool,
    sources_found: i64,
    sources_archived: i64,
    error: Option<String>,
    metadata: Option<String>,
    scheduled_job_id: Option<i64>,
}

impl ExecutionRow {
    fn into_record(self) -> Result<ExecutionRecord> {
        let job_id = Uuid::parse_str(&self.job_id)
            .map_err(|e| StoreError::CorruptRow(format!("job_id {}: {e}", self.job_id)))?;
        let metadata: Metadata = match self.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Metadata::new(),
        };
        Ok(ExecutionRecord {
            id: self.id,
            scheduled_job_id: self.scheduled_job_id,
            execution: JobExecution {
                job_id,
                plugin_name: self.plugin_name,
                started_at: self.started_at,
                completed_at: self.completed_at,
                success: self.success,
                sources_found: self.sources_found as u32,
                sources_archived: self.sources_archived as u32,
                error: self.error,
                metadata,
            },
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, job_id, plugin_name, started_at, completed_at, success, \
                                 sources_found, sources_archived, error, metadata, scheduled_job_id";

#[derive(Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record one execution. Returns the surrogate row id.
    pub async fn record(&self, execution: &JobExecution) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_executions
                (job_id, plugin_name, started_at, completed_at, success,
                 sources_found, sources_archived, error, metadata, scheduled_job_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT id FROM recurring_jobs WHERE job_id = ?))
            "#,
        )
        .bind(execution.job_id.to_string())
        .bind(&execution.plugin_name)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.success)
        .bind(execution.sources_found as i64)
        .bind(execution.sources_archived as i64)
        .bind(&execution.error)
        .bind(serde_json::to_string(&execution.metadata)?)
        .bind(execution.job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Record an execution without surfacing store failures to the caller.
    /// The execution already happened; losing the history row is the lesser
    /// problem and is logged.
    pub async fn record_best_effort(&self, execution: &JobExecution) {
        if let Err(e) = self.record(execution).await {
            warn!(job_id = %execution.job_id, error = %e, "Failed to persist execution record");
        }
    }

    /// Execution history, newest first, optionally filtered by job.
    pub async fn history(
        &self,
        job_id: Option<Uuid>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = match job_id {
            Some(id) => {
                sqlx::query_as::<_, ExecutionRow>(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE job_id = ? \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(id.to_string())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ExecutionRow>(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM job_executions \
                     ORDER BY started_at DESC LIMIT ? OFFSET ?"
                ))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(ExecutionRow::into_record).collect()
    }

    /// Recent executions across all jobs, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>> {
        self.history(None, limit, 0).await
    }

    pub async fn success_count(&self, job_id: Option<Uuid>) -> Result<u64> {
        self.count_with_success(job_id, true).await
    }

    pub async fn failure_count(&self, job_id: Option<Uuid>) -> Result<u64> {
        self.count_with_success(job_id, false).await
    }

    async fn count_with_success(&self, job_id: Option<Uuid>, success: bool) -> Result<u64> {
        let count: i64 = match job_id {
            Some(id) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM job_executions WHERE success = ? AND job_id = ?",
                )
                .bind(success)
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM job_executions WHERE success = ?")
                    .bind(success)
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    /// Prune executions started before `cutoff`. Returns the number deleted.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_executions WHERE started_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStore;
    use crate::schema::connect;
    use chrono::Duration;
    use haven_common::Job;

    async fn stores() -> (tempfile::TempDir, JobStore, ExecutionStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("haven.db").display());
        let pool = connect(&url).await.unwrap();
        (dir, JobStore::new(pool.clone()), ExecutionStore::new(pool))
    }

    fn finished_execution(job_id: Uuid, success: bool) -> JobExecution {
        let mut execution = JobExecution::started(job_id, "DemoPlugin");
        execution.completed_at = Some(Utc::now());
        execution.success = success;
        execution.sources_found = 3;
        execution.sources_archived = if success { 2 } else { 0 };
        execution
    }

    #[tokio::test]
    async fn record_and_query_history() {
        let (_dir, jobs, executions) = stores().await;
        let job = Job::builder().name("j").plugin_name("DemoPlugin").build();
        jobs.create(&job).await.unwrap();

        let id = executions
            .record(&finished_execution(job.job_id, true))
            .await
            .unwrap();
        assert!(id > 0);
        executions
            .record(&finished_execution(job.job_id, false))
            .await
            .unwrap();
        executions
            .record(&finished_execution(Uuid::new_v4(), true))
            .await
            .unwrap();

        let all = executions.recent(10).await.unwrap();
        assert_eq!(all.len(), 3);

        let for_job = executions.history(Some(job.job_id), 10, 0).await.unwrap();
        assert_eq!(for_job.len(), 2);
        // Job rows existed at record time, so the surrogate link is set.
        assert!(for_job.iter().all(|r| r.scheduled_job_id.is_some()));

        assert_eq!(executions.success_count(Some(job.job_id)).await.unwrap(), 1);
        assert_eq!(executions.failure_count(Some(job.job_id)).await.unwrap(), 1);
        assert_eq!(executions.success_count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn history_survives_job_deletion() {
        let (_dir, jobs, executions) = stores().await;
        let job = Job::builder().name("j").plugin_name("DemoPlugin").build();
        jobs.create(&job).await.unwrap();
        executions
            .record(&finished_execution(job.job_id, true))
            .await
            .unwrap();

        jobs.delete(job.job_id).await.unwrap();

        let orphans = executions.history(Some(job.job_id), 10, 0).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].execution.plugin_name, "DemoPlugin");
    }

    #[tokio::test]
    async fn delete_older_than_prunes_by_age() {
        let (_dir, _jobs, executions) = stores().await;
        let job_id = Uuid::new_v4();

        let mut old = finished_execution(job_id, true);
        old.started_at = Utc::now() - Duration::days(45);
        executions.record(&old).await.unwrap();
        executions
            .record(&finished_execution(job_id, true))
            .await
            .unwrap();

        let pruned = executions
            .delete_older_than(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(executions.recent(10).await.unwrap().len(), 1);
    }
}
