use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use haven_common::Config;

mod app;
mod services;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("haven=info".parse()?))
        .init();

    info!("Haven archival daemon starting...");

    let config = Config::daemon_from_env();
    config.log_summary();
    let retention = chrono::Duration::days(config.history_retention_days);

    let app = Application::build(config, services::local_services()).await?;
    app.start().await;

    // Daily execution-history pruning.
    let scheduler = app.scheduler.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        tick.tick().await;
        loop {
            tick.tick().await;
            scheduler.cleanup_history(retention).await;
        }
    });

    let status = app.scheduler.status().await;
    info!(
        total_jobs = status.total_jobs,
        active_jobs = status.active_jobs,
        "Scheduler running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    app.stop().await;

    Ok(())
}
