use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for scheduler state, known-source artifacts, and the
    /// default database file.
    pub data_dir: PathBuf,

    /// SQLite connection URL for jobs and execution history.
    pub database_url: String,

    // Concurrency gates
    pub max_concurrent_pipelines: usize,
    pub max_concurrent_archives: usize,

    // Pipeline step toggles (defaults for contexts that don't override them)
    pub analysis_enabled: bool,
    pub encryption_enabled: bool,
    pub upload_enabled: bool,
    pub sync_enabled: bool,

    /// Execution-history retention in days, used by periodic cleanup.
    pub history_retention_days: i64,
}

impl Config {
    /// Load config for the archival daemon. Every field has a default so a
    /// bare environment starts a working local instance.
    pub fn daemon_from_env() -> Self {
        let data_dir = PathBuf::from(env::var("HAVEN_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
        let database_url = env::var("HAVEN_DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}", data_dir.join("haven.db").display()));

        Self {
            data_dir,
            database_url,
            max_concurrent_pipelines: parsed_env("HAVEN_MAX_CONCURRENT_PIPELINES", 4),
            max_concurrent_archives: parsed_env("HAVEN_MAX_CONCURRENT_ARCHIVES", 3),
            analysis_enabled: flag_env("HAVEN_ANALYSIS_ENABLED", false),
            encryption_enabled: flag_env("HAVEN_ENCRYPTION_ENABLED", false),
            upload_enabled: flag_env("HAVEN_UPLOAD_ENABLED", true),
            sync_enabled: flag_env("HAVEN_SYNC_ENABLED", false),
            history_retention_days: parsed_env("HAVEN_HISTORY_RETENTION_DAYS", 30),
        }
    }

    /// Log the effective configuration without leaking anything sensitive.
    pub fn log_summary(&self) {
        tracing::info!(
            data_dir = %self.data_dir.display(),
            database_url = %self.database_url,
            max_concurrent_pipelines = self.max_concurrent_pipelines,
            max_concurrent_archives = self.max_concurrent_archives,
            "Configuration loaded"
        );
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn flag_env(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
