//! The composition root. Components are constructed once here and handed
//! to their collaborators explicitly; nothing reaches for globals.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use haven_common::Config;
use haven_events::EventBus;
use haven_pipeline::{PipelineBuilder, PipelineManager, PipelineServices};
use haven_plugin::PluginManager;
use haven_scheduler::{JobExecutor, JobScheduler};
use haven_store::{ExecutionStore, JobStore, KnownSourceStore};

/// Owns every long-lived component of the archival orchestrator.
pub struct Application {
    pub config: Config,
    pub bus: EventBus,
    pub plugins: Arc<PluginManager>,
    pub pipeline: Arc<PipelineManager>,
    pub scheduler: JobScheduler,
}

impl Application {
    /// Wire the stores, pipeline, executor, and scheduler together.
    /// Plugins are registered by the caller on `app.plugins` before
    /// starting.
    pub async fn build(config: Config, services: PipelineServices) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let pool = haven_store::connect(&config.database_url).await?;
        let job_store = JobStore::new(pool.clone());
        let executions = ExecutionStore::new(pool);
        let known_sources =
            Arc::new(KnownSourceStore::open(config.data_dir.join("sources")).await?);

        let bus = EventBus::new();
        let plugins = Arc::new(PluginManager::new());

        let pipeline = Arc::new(
            PipelineBuilder::new(services, bus.clone())
                .with_max_concurrent(config.max_concurrent_pipelines)
                .with_ingest()
                .with_analysis(config.analysis_enabled)
                .with_encryption(config.encryption_enabled)
                .with_upload(config.upload_enabled)
                .with_sync(config.sync_enabled)
                .build(),
        );

        let executor = Arc::new(JobExecutor::new(
            plugins.clone(),
            known_sources,
            pipeline.clone(),
            executions.clone(),
            bus.clone(),
            config.max_concurrent_archives,
        ));

        let scheduler = JobScheduler::new(
            job_store,
            executions,
            executor,
            config.data_dir.clone(),
        );

        Ok(Self {
            config,
            bus,
            plugins,
            pipeline,
            scheduler,
        })
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stop the scheduler and shut plugins down, best-effort.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.plugins.shutdown_all().await;
        info!("Application stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::local_services;
    use haven_plugin::testing::ScriptedPlugin;

    #[tokio::test]
    async fn builds_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            database_url: format!("sqlite://{}", dir.path().join("haven.db").display()),
            max_concurrent_pipelines: 2,
            max_concurrent_archives: 2,
            analysis_enabled: false,
            encryption_enabled: false,
            upload_enabled: false,
            sync_enabled: false,
            history_retention_days: 30,
        };

        let app = Application::build(config, local_services()).await.unwrap();
        app.plugins
            .register(Arc::new(ScriptedPlugin::new("DemoPlugin")), None)
            .await;

        app.start().await;
        assert!(app.scheduler.is_running());
        assert_eq!(
            app.pipeline.step_names(),
            vec!["ingest", "analyze", "encrypt", "upload", "sync"]
        );

        app.stop().await;
        assert!(!app.scheduler.is_running());
    }
}
