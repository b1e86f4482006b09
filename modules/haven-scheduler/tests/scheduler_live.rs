//! Live scheduler runs against a scripted plugin: real cron triggers,
//! real stores, an every-second schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use haven_common::{Job, MediaSource, OnSuccess};
use haven_events::EventBus;
use haven_pipeline::PipelineManager;
use haven_plugin::testing::ScriptedPlugin;
use haven_plugin::PluginManager;
use haven_scheduler::{JobExecutor, JobScheduler};
use haven_store::{ExecutionStore, JobStore, KnownSourceStore};

struct Harness {
    _dir: tempfile::TempDir,
    scheduler: JobScheduler,
    plugins: Arc<PluginManager>,
    known_sources: Arc<KnownSourceStore>,
    executions: ExecutionStore,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("haven.db").display());
    let pool = haven_store::connect(&url).await.unwrap();
    let job_store = JobStore::new(pool.clone());
    let executions = ExecutionStore::new(pool);

    let known_sources = Arc::new(KnownSourceStore::open(dir.path().join("sources")).await.unwrap());
    let plugins = Arc::new(PluginManager::new());
    let bus = EventBus::new();
    let pipeline = Arc::new(PipelineManager::new(4, bus.clone()));
    let executor = Arc::new(JobExecutor::new(
        plugins.clone(),
        known_sources.clone(),
        pipeline,
        executions.clone(),
        bus,
        3,
    ));
    let scheduler = JobScheduler::new(job_store, executions.clone(), executor, dir.path());

    Harness {
        _dir: dir,
        scheduler,
        plugins,
        known_sources,
        executions,
    }
}

fn every_second_job() -> Job {
    Job::builder()
        .name("fast job")
        .plugin_name("DemoPlugin")
        .schedule("* * * * * *")
        .on_success(OnSuccess::ArchiveNew)
        .build()
}

#[tokio::test]
async fn scheduled_job_fires_archives_and_dedupes() {
    let hx = harness().await;
    let plugin = Arc::new(ScriptedPlugin::new("DemoPlugin").with_sources(vec![
        MediaSource::new("vid_1", "video", "https://example.com/vid_1"),
    ]));
    hx.plugins.register(plugin.clone(), None).await;

    let job = hx.scheduler.add(every_second_job()).await.unwrap();
    hx.scheduler.start().await;

    // Let the trigger fire at least twice.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    hx.scheduler.stop().await;

    let history = hx.scheduler.history(Some(job.job_id), 50).await;
    assert!(history.len() >= 2, "expected at least two fires, got {}", history.len());
    assert!(history.iter().all(|ex| ex.success));
    assert!(history.iter().all(|ex| ex.sources_archived <= ex.sources_found));

    // First fire archived the source, every later fire deduped it.
    let archived_total: u32 = history.iter().map(|ex| ex.sources_archived).sum();
    assert_eq!(archived_total, 1);
    assert_eq!(plugin.archive_calls(), 1);
    assert!(hx.known_sources.contains("DemoPlugin", "vid_1").await.unwrap());

    // Stats made it to the durable store.
    let stored = hx.scheduler.get_job(job.job_id).await.unwrap();
    assert!(stored.run_count >= 2);
    assert_eq!(stored.error_count, 0);
    assert!(stored.last_run.is_some());
}

#[tokio::test]
async fn paused_job_stops_firing_until_resumed() {
    let hx = harness().await;
    let plugin = Arc::new(ScriptedPlugin::new("DemoPlugin"));
    hx.plugins.register(plugin, None).await;

    let job = hx.scheduler.add(every_second_job()).await.unwrap();
    hx.scheduler.start().await;

    assert_eq!(hx.scheduler.status().await.active_jobs, 1);
    hx.scheduler.pause(job.job_id).await;
    assert_eq!(hx.scheduler.status().await.active_jobs, 0);

    let fired_before = hx.executions.history(Some(job.job_id), 100, 0).await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let fired_after = hx.executions.history(Some(job.job_id), 100, 0).await.unwrap().len();
    assert_eq!(fired_before, fired_after, "paused job must not fire");

    hx.scheduler.resume(job.job_id).await;
    let resumed = hx.scheduler.get_job(job.job_id).await.unwrap();
    assert!(resumed.enabled);
    assert!(resumed.next_run.unwrap() > Utc::now());
    assert_eq!(hx.scheduler.status().await.in_engine, 1);

    hx.scheduler.stop().await;
}

#[tokio::test]
async fn known_sources_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    // First life: archive vid_A.
    {
        let store = KnownSourceStore::open(dir.path().join("sources")).await.unwrap();
        store.add("DemoPlugin", "vid_A").await.unwrap();
    }

    // Second life: same data dir, fresh everything else. The plugin still
    // reports vid_A, but it is already known.
    let url = format!("sqlite://{}", dir.path().join("haven.db").display());
    let pool = haven_store::connect(&url).await.unwrap();
    let executions = ExecutionStore::new(pool.clone());
    let known_sources = Arc::new(KnownSourceStore::open(dir.path().join("sources")).await.unwrap());
    let plugins = Arc::new(PluginManager::new());
    let bus = EventBus::new();
    let executor = JobExecutor::new(
        plugins.clone(),
        known_sources,
        Arc::new(PipelineManager::new(4, bus.clone())),
        executions,
        bus,
        3,
    );

    let plugin = Arc::new(ScriptedPlugin::new("DemoPlugin").with_sources(vec![
        MediaSource::new("vid_A", "video", "https://example.com/vid_A"),
    ]));
    plugins.register(plugin.clone(), None).await;

    let job = Job::builder()
        .name("restarted")
        .plugin_name("DemoPlugin")
        .build();
    let execution = executor.execute(&job).await;

    assert!(execution.success);
    assert_eq!(execution.sources_found, 1);
    assert_eq!(execution.sources_archived, 0);
    assert_eq!(plugin.archive_calls(), 0);
}
