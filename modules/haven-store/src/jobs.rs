//! Durable persistence of job definitions.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use haven_common::{Job, Metadata, OnSuccess};

use crate::{Result, StoreError};

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: String,
    plugin_name: String,
    name: String,
    schedule: String,
    on_success: String,
    metadata: Option<String>,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    run_count: i64,
    error_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let job_id = Uuid::parse_str(&self.job_id)
            .map_err(|e| StoreError::CorruptRow(format!("job_id {}: {e}", self.job_id)))?;
        let on_success: OnSuccess = self
            .on_success
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("on_success {}", self.on_success)))?;
        let metadata: Metadata = match self.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Metadata::new(),
        };

        Ok(Job {
            job_id,
            name: self.name,
            plugin_name: self.plugin_name,
            schedule: self.schedule,
            on_success,
            enabled: self.enabled,
            metadata,
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count as u32,
            error_count: self.error_count as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Fields touched when recording an execution against a job.
#[derive(Debug, Clone, Default)]
pub struct JobStatsUpdate {
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub increment_run: bool,
    pub increment_error: bool,
}

const JOB_COLUMNS: &str = "job_id, plugin_name, name, schedule, on_success, metadata, enabled, \
                           last_run, next_run, run_count, error_count, created_at, updated_at";

/// CRUD over the `recurring_jobs` table. All writes are durable before
/// return; deleting a job never cascades to its execution history.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_jobs
                (job_id, plugin_name, name, schedule, on_success, metadata, enabled,
                 last_run, next_run, run_count, error_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.plugin_name)
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(job.on_success.as_str())
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(job.enabled)
        .bind(job.last_run)
        .bind(job.next_run)
        .bind(job.run_count as i64)
        .bind(job.error_count as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM recurring_jobs WHERE job_id = ?"
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    pub async fn get_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM recurring_jobs ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn get_enabled(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM recurring_jobs WHERE enabled = 1 ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Overwrite the mutable fields of an existing job, keyed by job id.
    /// Returns false if the job does not exist.
    pub async fn update(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_jobs
            SET name = ?, plugin_name = ?, schedule = ?, on_success = ?, metadata = ?,
                enabled = ?, last_run = ?, next_run = ?, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.plugin_name)
        .bind(&job.schedule)
        .bind(job.on_success.as_str())
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(job.enabled)
        .bind(job.last_run)
        .bind(job.next_run)
        .bind(Utc::now())
        .bind(job.job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recurring_jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_stats(&self, job_id: Uuid, update: JobStatsUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_jobs
            SET last_run = COALESCE(?, last_run),
                next_run = COALESCE(?, next_run),
                run_count = run_count + ?,
                error_count = error_count + ?,
                updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(update.last_run)
        .bind(update.next_run)
        .bind(update.increment_run as i64)
        .bind(update.increment_error as i64)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::connect;

    async fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("haven.db").display());
        let pool = connect(&url).await.unwrap();
        (dir, JobStore::new(pool))
    }

    fn sample_job() -> Job {
        Job::builder()
            .name("Nightly archive")
            .plugin_name("DemoPlugin")
            .schedule("0 0 * * *")
            .build()
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (_dir, store) = store().await;
        let mut job = sample_job();
        job.metadata
            .insert("channel".to_string(), serde_json::json!("news"));

        store.create(&job).await.unwrap();
        let loaded = store.get(job.job_id).await.unwrap().unwrap();

        assert_eq!(loaded.job_id, job.job_id);
        assert_eq!(loaded.name, job.name);
        assert_eq!(loaded.schedule, job.schedule);
        assert_eq!(loaded.on_success, job.on_success);
        assert_eq!(loaded.metadata["channel"], serde_json::json!("news"));
        assert!(loaded.enabled);
    }

    #[tokio::test]
    async fn get_enabled_filters_disabled_jobs() {
        let (_dir, store) = store().await;
        let enabled = sample_job();
        let mut disabled = sample_job();
        disabled.enabled = false;

        store.create(&enabled).await.unwrap();
        store.create(&disabled).await.unwrap();

        assert_eq!(store.get_all().await.unwrap().len(), 2);
        let active = store.get_enabled().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id, enabled.job_id);
    }

    #[tokio::test]
    async fn update_overwrites_mutable_fields() {
        let (_dir, store) = store().await;
        let mut job = sample_job();
        store.create(&job).await.unwrap();

        job.enabled = false;
        job.schedule = "*/30 * * * *".to_string();
        assert!(store.update(&job).await.unwrap());

        let loaded = store.get(job.job_id).await.unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.schedule, "*/30 * * * *");

        let ghost = sample_job();
        assert!(!store.update(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn update_stats_increments_counters() {
        let (_dir, store) = store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        let now = Utc::now();
        store
            .update_stats(
                job.job_id,
                JobStatsUpdate {
                    last_run: Some(now),
                    increment_run: true,
                    increment_error: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_stats(
                job.job_id,
                JobStatsUpdate {
                    increment_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_count, 2);
        assert_eq!(loaded.error_count, 1);
        assert!(loaded.last_run.is_some());
    }

    #[tokio::test]
    async fn delete_removes_job() {
        let (_dir, store) = store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        assert!(store.delete(job.job_id).await.unwrap());
        assert!(store.get(job.job_id).await.unwrap().is_none());
        assert!(!store.delete(job.job_id).await.unwrap());
    }
}
