//! Executes one job: resolve plugin → discover → filter → archive →
//! enqueue pipeline work.

use std::sync::Arc;

use anyhow::bail;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use haven_common::{Job, JobExecution, MediaSource, Metadata, OnSuccess};
use haven_events::{Event, EventBus, EventType};
use haven_pipeline::{PipelineContext, PipelineManager};
use haven_plugin::{ArchiverPlugin, PluginManager};
use haven_store::{ExecutionStore, KnownSourceStore};

/// Coordinates plugins, the known-source store, and the pipeline for one
/// job execution at a time.
pub struct JobExecutor {
    plugins: Arc<PluginManager>,
    known_sources: Arc<KnownSourceStore>,
    pipeline: Arc<PipelineManager>,
    executions: ExecutionStore,
    bus: EventBus,
    archive_gate: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(
        plugins: Arc<PluginManager>,
        known_sources: Arc<KnownSourceStore>,
        pipeline: Arc<PipelineManager>,
        executions: ExecutionStore,
        bus: EventBus,
        max_concurrent_archives: usize,
    ) -> Self {
        Self {
            plugins,
            known_sources,
            pipeline,
            executions,
            bus,
            archive_gate: Arc::new(Semaphore::new(max_concurrent_archives.max(1))),
        }
    }

    /// Run one job to completion. Never bubbles an error: failures come
    /// back as an unsuccessful execution record. The record is persisted
    /// best-effort before returning.
    pub async fn execute(&self, job: &Job) -> JobExecution {
        let mut execution = JobExecution::started(job.job_id, &job.plugin_name);

        if let Err(e) = self.run(job, &mut execution).await {
            error!(job = %job.name, job_id = %job.job_id, error = %e, "Job execution failed");
            execution.success = false;
            execution.error = Some(e.to_string());
        } else {
            execution.success = true;
        }
        execution.completed_at = Some(Utc::now());

        self.executions.record_best_effort(&execution).await;
        execution
    }

    async fn run(&self, job: &Job, execution: &mut JobExecution) -> anyhow::Result<()> {
        let Some(plugin) = self.plugins.get(&job.plugin_name).await else {
            bail!("plugin not found: {}", job.plugin_name);
        };

        if !plugin.health_check().await {
            bail!("plugin unhealthy: {}", job.plugin_name);
        }

        info!(job = %job.name, plugin = %job.plugin_name, "Discovering sources");
        let sources = plugin.discover().await?;
        execution.sources_found = sources.len() as u32;

        self.bus
            .publish(
                Event::new(
                    EventType::SourcesDiscovered,
                    "job_executor",
                    json!({
                        "plugin": job.plugin_name,
                        "count": sources.len(),
                    }),
                )
                .with_correlation(job.job_id),
            )
            .await;

        if sources.is_empty() {
            info!(job = %job.name, "No sources discovered");
            return Ok(());
        }

        let to_archive = self.filter_sources(job, sources).await?;
        info!(
            job = %job.name,
            found = execution.sources_found,
            to_archive = to_archive.len(),
            policy = %job.on_success,
            "Archiving sources"
        );

        let outcomes = join_all(
            to_archive
                .into_iter()
                .map(|source| self.archive_one(job, plugin.clone(), source)),
        )
        .await;
        execution.sources_archived = outcomes.into_iter().filter(|archived| *archived).count() as u32;

        Ok(())
    }

    /// Apply the job's on-success policy to the discovered sources.
    async fn filter_sources(
        &self,
        job: &Job,
        sources: Vec<MediaSource>,
    ) -> anyhow::Result<Vec<MediaSource>> {
        match job.on_success {
            OnSuccess::LogOnly => Ok(Vec::new()),
            // archive_all is an explicit re-archive-everything mode: the
            // known-source store is not consulted.
            OnSuccess::ArchiveAll => Ok(sources),
            OnSuccess::ArchiveNew => {
                let ids: Vec<String> = sources.iter().map(|s| s.source_id.clone()).collect();
                let new_ids = self.known_sources.filter_new(&job.plugin_name, &ids).await?;
                Ok(sources
                    .into_iter()
                    .filter(|s| new_ids.contains(&s.source_id))
                    .collect())
            }
        }
    }

    /// Archive one source under the archive gate. Returns true when the
    /// archive succeeded; failures are logged and skipped, they do not
    /// fail the job.
    async fn archive_one(
        &self,
        job: &Job,
        plugin: Arc<dyn ArchiverPlugin>,
        source: MediaSource,
    ) -> bool {
        let Ok(_permit) = self.archive_gate.clone().acquire_owned().await else {
            return false;
        };

        self.bus
            .publish(
                Event::new(
                    EventType::ArchiveStarted,
                    "job_executor",
                    json!({
                        "plugin": job.plugin_name,
                        "source_id": source.source_id,
                        "uri": source.uri,
                    }),
                )
                .with_correlation(job.job_id),
            )
            .await;

        let outcome = match plugin.archive(&source).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(source_id = %source.source_id, error = %e, "Archive call failed");
                return false;
            }
        };
        if !outcome.success {
            warn!(
                source_id = %source.source_id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Failed to archive source"
            );
            return false;
        }

        self.bus
            .publish(
                Event::new(
                    EventType::ArchiveComplete,
                    "job_executor",
                    json!({
                        "plugin": job.plugin_name,
                        "source_id": source.source_id,
                        "path": outcome.output_path.as_ref().map(|p| p.display().to_string()),
                        "file_size": outcome.file_size,
                    }),
                )
                .with_correlation(job.job_id),
            )
            .await;

        // Only archive_new consults the known set, so only it updates it.
        if job.on_success == OnSuccess::ArchiveNew {
            if let Err(e) = self
                .known_sources
                .add(&job.plugin_name, source.source_id.clone())
                .await
            {
                warn!(source_id = %source.source_id, error = %e, "Failed to persist known source");
            }
        }

        let Some(output_path) = outcome.output_path else {
            warn!(source_id = %source.source_id, "Archive succeeded without an output path");
            return true;
        };

        self.enqueue_pipeline(job, &source, output_path).await;
        true
    }

    /// Hand the archived file to the pipeline without awaiting completion.
    async fn enqueue_pipeline(&self, job: &Job, source: &MediaSource, path: std::path::PathBuf) {
        let mut options = Metadata::new();
        options.insert("job_id".to_string(), json!(job.job_id.to_string()));
        options.insert("plugin_name".to_string(), json!(job.plugin_name));
        options.insert("source_id".to_string(), json!(source.source_id));
        options.insert("source_uri".to_string(), json!(source.uri));
        for (key, value) in &source.metadata {
            options.insert(key.clone(), value.clone());
        }
        for (key, value) in &job.metadata {
            options.insert(key.clone(), value.clone());
        }

        let mut ctx = PipelineContext::new(path).with_options(options);
        let pipeline = self.pipeline.clone();
        let job_id = job.job_id;
        tokio::spawn(async move {
            let result = pipeline.process(&mut ctx).await;
            if result.success {
                info!(path = %result.source_path, cid = ?result.final_content_id, "Pipeline completed");
            } else {
                error!(
                    job_id = %job_id,
                    path = %result.source_path,
                    error = ?result.error,
                    "Pipeline failed"
                );
            }
        });
    }
}

/// Runs several jobs concurrently under a job-level gate, preserving the
/// input order of results.
pub struct BatchJobExecutor {
    executor: Arc<JobExecutor>,
    max_concurrent: usize,
}

impl BatchJobExecutor {
    pub fn new(executor: Arc<JobExecutor>, max_concurrent: usize) -> Self {
        Self {
            executor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn execute_batch(&self, jobs: &[Job]) -> Vec<JobExecution> {
        let gate = Arc::new(Semaphore::new(self.max_concurrent));
        let tasks = jobs.iter().map(|job| {
            let gate = gate.clone();
            let executor = self.executor.clone();
            async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return JobExecution::failed_now(job.job_id, &job.plugin_name, "job gate closed");
                };
                executor.execute(job).await
            }
        });
        join_all(tasks).await
    }
}
