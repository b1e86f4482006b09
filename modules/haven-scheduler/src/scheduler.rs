//! The recurring-job scheduler: owns the job map, couples it to durable
//! storage, and drives the trigger engine.
//!
//! Jobs live in the database; a versioned JSON backup in the data
//! directory covers recovery when the database is unavailable or corrupt.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use haven_common::{HavenError, Job, JobExecution, Metadata, OnSuccess};
use haven_store::{ExecutionStore, JobStatsUpdate, JobStore};

use crate::cron::{next_run_or_fallback, CronSchedule};
use crate::engine::{CronEngine, FireHandler};
use crate::executor::JobExecutor;

const MAX_HISTORY: usize = 1000;
const STATE_FILE_VERSION: &str = "1.0.0";
const SHUTDOWN_GRACE: StdDuration = StdDuration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: String,
    saved_at: DateTime<Utc>,
    jobs: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateJob {
    job_id: Uuid,
    name: String,
    plugin_name: String,
    schedule: String,
    on_success: OnSuccess,
    enabled: bool,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    run_count: u32,
    #[serde(default)]
    error_count: u32,
}

#[derive(Debug, Clone)]
pub struct JobNextRun {
    pub job_id: Uuid,
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_jobs: usize,
    pub active_jobs: usize,
    /// Triggers currently registered in the cron engine.
    pub in_engine: usize,
    pub next_runs: Vec<JobNextRun>,
}

struct SchedulerInner {
    jobs: RwLock<HashMap<Uuid, Job>>,
    job_store: JobStore,
    executions: ExecutionStore,
    executor: Arc<JobExecutor>,
    engine: CronEngine,
    running: AtomicBool,
    history: Mutex<VecDeque<JobExecution>>,
    state_file: PathBuf,
}

/// Manages recurring jobs: add/remove/pause/resume/run-now, durable
/// persistence, execution history, and the cron engine lifecycle.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        job_store: JobStore,
        executions: ExecutionStore,
        executor: Arc<JobExecutor>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: RwLock::new(HashMap::new()),
                job_store,
                executions,
                executor,
                engine: CronEngine::new(),
                running: AtomicBool::new(false),
                history: Mutex::new(VecDeque::new()),
                state_file: data_dir.into().join("scheduler_state.json"),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Load persisted jobs and start firing enabled ones on their cron
    /// schedules.
    pub async fn start(&self) {
        if self.is_running() {
            warn!("Scheduler already running");
            return;
        }
        info!("Starting job scheduler");

        self.load_persisted_jobs().await;

        let enabled: Vec<Job> = {
            let jobs = self.inner.jobs.read().await;
            jobs.values().filter(|j| j.enabled).cloned().collect()
        };
        for job in &enabled {
            self.register_trigger(job);
        }

        self.inner.running.store(true, Ordering::SeqCst);
        info!(jobs = enabled.len(), "Scheduler started");
    }

    /// Save the state backup, then shut the engine down, waiting up to the
    /// grace period for in-flight fires.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("Stopping job scheduler");

        self.save_state().await;
        self.inner.engine.shutdown(SHUTDOWN_GRACE).await;
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// Add (or replace) a job. The cron expression is validated here;
    /// an invalid one is a scheduling error at add-time.
    pub async fn add(&self, mut job: Job) -> Result<Job, HavenError> {
        let schedule = CronSchedule::parse(&job.schedule)?;
        job.next_run = if job.enabled { schedule.upcoming() } else { None };
        job.updated_at = Utc::now();

        self.inner
            .jobs
            .write()
            .await
            .insert(job.job_id, job.clone());
        self.persist_job(&job).await;

        if self.is_running() {
            if job.enabled {
                self.register_trigger(&job);
            } else {
                // Replacing an enabled definition with a disabled one drops
                // its trigger.
                self.inner.engine.unregister(job.job_id);
            }
        }

        info!(job = %job.name, job_id = %job.job_id, schedule = %job.schedule, "Added job");
        Ok(job)
    }

    /// Remove a job. Its execution history stays queryable as orphans.
    pub async fn remove(&self, job_id: Uuid) -> bool {
        if self.inner.jobs.write().await.remove(&job_id).is_none() {
            return false;
        }
        self.inner.engine.unregister(job_id);
        if let Err(e) = self.inner.job_store.delete(job_id).await {
            error!(job_id = %job_id, error = %e, "Failed to delete job from store");
        }
        info!(job_id = %job_id, "Removed job");
        true
    }

    /// Disable a job: no next run until resumed. A second pause is a
    /// no-op beyond the first.
    pub async fn pause(&self, job_id: Uuid) -> bool {
        let updated = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(&job_id) {
                Some(job) => {
                    job.enabled = false;
                    job.next_run = None;
                    job.updated_at = Utc::now();
                    Some(job.clone())
                }
                None => None,
            }
        };
        let Some(job) = updated else {
            return false;
        };

        if let Err(e) = self.inner.job_store.update(&job).await {
            error!(job_id = %job_id, error = %e, "Failed to persist pause");
        }
        self.inner.engine.unregister(job_id);
        info!(job_id = %job_id, "Paused job");
        true
    }

    /// Re-enable a paused job and schedule a future next run.
    pub async fn resume(&self, job_id: Uuid) -> bool {
        let updated = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(&job_id) {
                Some(job) => {
                    job.enabled = true;
                    job.next_run = Some(next_run_or_fallback(&job.schedule));
                    job.updated_at = Utc::now();
                    Some(job.clone())
                }
                None => None,
            }
        };
        let Some(job) = updated else {
            return false;
        };

        if let Err(e) = self.inner.job_store.update(&job).await {
            error!(job_id = %job_id, error = %e, "Failed to persist resume");
        }
        if self.is_running() {
            self.register_trigger(&job);
        }
        info!(job_id = %job_id, "Resumed job");
        true
    }

    /// Execute a job immediately, outside its schedule. History is still
    /// recorded; a disabled job is not run and comes back as a skipped,
    /// unrecorded result.
    pub async fn run_now(&self, job_id: Uuid) -> Result<JobExecution, HavenError> {
        let job = {
            let jobs = self.inner.jobs.read().await;
            jobs.get(&job_id).cloned()
        }
        .ok_or(HavenError::JobNotFound(job_id))?;

        if !job.enabled {
            debug!(job_id = %job_id, "run_now on a disabled job, skipping");
            return Ok(JobExecution::failed_now(
                job.job_id,
                &job.plugin_name,
                "job is disabled",
            ));
        }

        let execution = self.inner.executor.execute(&job).await;
        let update_next_run = self.is_running() && self.inner.engine.contains(job_id);
        self.record(&job, &execution, update_next_run).await;
        Ok(execution)
    }

    /// Execution history, newest first. Reads the database; falls back to
    /// the in-memory ring if the database is unavailable.
    pub async fn history(&self, job_id: Option<Uuid>, limit: u32) -> Vec<JobExecution> {
        match self.inner.executions.history(job_id, limit, 0).await {
            Ok(records) => records.into_iter().map(|r| r.execution).collect(),
            Err(e) => {
                warn!(error = %e, "History query failed, serving in-memory ring");
                let ring = self.inner.history.lock().unwrap();
                ring.iter()
                    .rev()
                    .filter(|ex| job_id.is_none_or(|id| ex.job_id == id))
                    .take(limit as usize)
                    .cloned()
                    .collect()
            }
        }
    }

    /// Prune execution records older than the given age. Returns how many
    /// were deleted.
    pub async fn cleanup_history(&self, older_than: chrono::Duration) -> u64 {
        let cutoff = Utc::now() - older_than;
        match self.inner.executions.delete_older_than(cutoff).await {
            Ok(deleted) => {
                info!(deleted, "Cleaned up old execution records");
                deleted
            }
            Err(e) => {
                error!(error = %e, "Failed to clean up execution history");
                0
            }
        }
    }

    pub async fn jobs(&self) -> Vec<Job> {
        let jobs = self.inner.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.created_at);
        all
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let jobs = self.inner.jobs.read().await;
        let next_runs = self
            .inner
            .engine
            .next_runs()
            .into_iter()
            .map(|(job_id, next_run)| JobNextRun {
                job_id,
                name: jobs.get(&job_id).map(|j| j.name.clone()).unwrap_or_default(),
                next_run,
            })
            .collect();

        SchedulerStatus {
            running: self.is_running(),
            total_jobs: jobs.len(),
            active_jobs: jobs.values().filter(|j| j.enabled).count(),
            in_engine: self.inner.engine.len(),
            next_runs,
        }
    }

    /// Best-effort JSON dump of the current job definitions, versioned for
    /// forward compatibility.
    pub async fn save_state(&self) {
        let jobs: Vec<serde_json::Value> = {
            let jobs = self.inner.jobs.read().await;
            jobs.values()
                .map(|j| {
                    serde_json::to_value(StateJob {
                        job_id: j.job_id,
                        name: j.name.clone(),
                        plugin_name: j.plugin_name.clone(),
                        schedule: j.schedule.clone(),
                        on_success: j.on_success,
                        enabled: j.enabled,
                        metadata: j.metadata.clone(),
                        run_count: j.run_count,
                        error_count: j.error_count,
                    })
                    .unwrap_or(serde_json::Value::Null)
                })
                .collect()
        };

        let state = StateFile {
            version: STATE_FILE_VERSION.to_string(),
            saved_at: Utc::now(),
            jobs,
        };

        let write = async {
            if let Some(parent) = self.inner.state_file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let raw = serde_json::to_vec_pretty(&state)?;
            tokio::fs::write(&self.inner.state_file, raw).await?;
            anyhow::Ok(())
        };
        match write.await {
            Ok(()) => debug!(path = %self.inner.state_file.display(), "Saved scheduler state"),
            Err(e) => error!(error = %e, "Failed to save scheduler state"),
        }
    }

    async fn load_persisted_jobs(&self) {
        {
            let jobs = self.inner.jobs.read().await;
            if !jobs.is_empty() {
                debug!("Jobs already in memory, skipping load");
                return;
            }
        }

        match self.inner.job_store.get_all().await {
            Ok(db_jobs) => {
                let mut jobs = self.inner.jobs.write().await;
                for job in db_jobs {
                    jobs.insert(job.job_id, job);
                }
                info!(count = jobs.len(), "Loaded jobs from database");
            }
            Err(e) => {
                error!(error = %e, "Failed to load jobs from database");
            }
        }

        // Merge the JSON backup: entries the database didn't produce are
        // restored (resilience against a corrupt or lost database).
        self.load_state_file().await;
    }

    async fn load_state_file(&self) {
        let raw = match tokio::fs::read(&self.inner.state_file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No scheduler state file to load");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to read scheduler state file");
                return;
            }
        };

        let state: StateFile = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Corrupt scheduler state file, ignoring");
                return;
            }
        };

        let mut restored = 0usize;
        let mut jobs = self.inner.jobs.write().await;
        for value in state.jobs {
            let entry: StateJob = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable job in state file");
                    continue;
                }
            };
            if jobs.contains_key(&entry.job_id) {
                continue;
            }
            let job = Job {
                job_id: entry.job_id,
                name: entry.name,
                plugin_name: entry.plugin_name,
                schedule: entry.schedule,
                on_success: entry.on_success,
                enabled: entry.enabled,
                metadata: entry.metadata,
                last_run: None,
                next_run: None,
                run_count: entry.run_count,
                error_count: entry.error_count,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            jobs.insert(job.job_id, job);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored jobs from state file backup");
        }
    }

    /// Upsert the job row; store failures are logged, the in-memory
    /// scheduler keeps working.
    async fn persist_job(&self, job: &Job) {
        let result = match self.inner.job_store.get(job.job_id).await {
            Ok(Some(_)) => self.inner.job_store.update(job).await.map(|_| ()),
            Ok(None) => self.inner.job_store.create(job).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(job_id = %job.job_id, error = %e, "Failed to persist job");
        }
    }

    fn register_trigger(&self, job: &Job) {
        let schedule = match CronSchedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(job = %job.name, job_id = %job.job_id, error = %e, "Cannot schedule job");
                return;
            }
        };

        // The fire handler captures the scheduler weakly: triggers never
        // keep a stopped scheduler alive.
        let weak = Arc::downgrade(&self.inner);
        let handler: FireHandler = Arc::new(move |job_id| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    let scheduler = JobScheduler { inner };
                    scheduler.fire_job(job_id).await;
                }
            })
        });
        self.inner.engine.register(job.job_id, schedule, handler);
        debug!(job = %job.name, job_id = %job.job_id, "Registered cron trigger");
    }

    /// Invoked by the engine when a trigger fires.
    async fn fire_job(&self, job_id: Uuid) {
        let job = {
            let jobs = self.inner.jobs.read().await;
            jobs.get(&job_id).cloned()
        };
        let Some(job) = job else {
            warn!(job_id = %job_id, "Fired job not found, skipping");
            return;
        };
        if !job.enabled {
            warn!(job_id = %job_id, "Fired job is disabled, skipping");
            return;
        }

        info!(job = %job.name, job_id = %job_id, "Executing scheduled job");
        let execution = self.inner.executor.execute(&job).await;
        self.record(&job, &execution, true).await;
    }

    /// Record one execution: memory ring, in-memory job stats, and the
    /// durable stats row. The execution row itself was already written by
    /// the executor.
    async fn record(&self, job: &Job, execution: &JobExecution, update_next_run: bool) {
        {
            let mut ring = self.inner.history.lock().unwrap();
            ring.push_back(execution.clone());
            while ring.len() > MAX_HISTORY {
                ring.pop_front();
            }
        }

        let next_run = if update_next_run {
            self.inner.engine.next_run(job.job_id)
        } else {
            None
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(j) = jobs.get_mut(&job.job_id) {
                j.last_run = Some(execution.started_at);
                j.run_count += 1;
                if !execution.success {
                    j.error_count += 1;
                }
                if let Some(next) = next_run {
                    j.next_run = Some(next);
                }
                j.updated_at = Utc::now();
            }
        }

        let stats = JobStatsUpdate {
            last_run: Some(execution.started_at),
            next_run,
            increment_run: true,
            increment_error: !execution.success,
        };
        if let Err(e) = self.inner.job_store.update_stats(job.job_id, stats).await {
            error!(job_id = %job.job_id, error = %e, "Failed to persist job stats");
        }

        if execution.success {
            info!(
                job = %job.name,
                found = execution.sources_found,
                archived = execution.sources_archived,
                "Job completed"
            );
        } else {
            error!(
                job = %job.name,
                error = execution.error.as_deref().unwrap_or("unknown"),
                "Job failed"
            );
        }
    }
}
