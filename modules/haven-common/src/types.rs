//! Shared domain types for the archival orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::HavenError;

/// Free-form metadata attached to sources, jobs, and results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Archive priority for a discovered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    High,
    #[default]
    Medium,
    Low,
}

/// A media source discovered by a plugin.
///
/// Two sources from the same plugin with equal `source_id` refer to the
/// same logical item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSource {
    /// Opaque identifier, unique within the producing plugin.
    pub source_id: String,
    /// Media type tag (youtube, podcast, livestream, ...).
    pub media_type: String,
    /// Resource locator for the media.
    pub uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: SourcePriority,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MediaSource {
    pub fn new(source_id: impl Into<String>, media_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            media_type: media_type.into(),
            uri: uri.into(),
            title: String::new(),
            priority: SourcePriority::default(),
            metadata: Metadata::new(),
        }
    }
}

/// Outcome of archiving a single media source.
///
/// On success `output_path` points at a readable regular file of
/// `file_size` bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub file_size: u64,
    /// Media duration in seconds, for timed media.
    pub duration_secs: f64,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ArchiveOutcome {
    pub fn ok(output_path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            success: true,
            output_path: Some(output_path.into()),
            file_size,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// What the executor does with discovered sources on a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    /// Archive every discovered source; the known-source store is bypassed.
    ArchiveAll,
    /// Archive only sources not yet in the known-source store.
    #[default]
    ArchiveNew,
    /// Log discoveries, archive nothing.
    LogOnly,
}

impl OnSuccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnSuccess::ArchiveAll => "archive_all",
            OnSuccess::ArchiveNew => "archive_new",
            OnSuccess::LogOnly => "log_only",
        }
    }
}

impl fmt::Display for OnSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnSuccess {
    type Err = HavenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive_all" => Ok(OnSuccess::ArchiveAll),
            "archive_new" => Ok(OnSuccess::ArchiveNew),
            "log_only" => Ok(OnSuccess::LogOnly),
            other => Err(HavenError::Validation(format!(
                "unknown on_success policy: {other}"
            ))),
        }
    }
}

/// A durable, named, scheduled configuration that fires plugin discovery
/// on a cron recurrence.
///
/// `next_run` is either `None` (disabled) or strictly in the future
/// relative to the last scheduling evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub job_id: Uuid,
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub plugin_name: String,
    /// Cron expression, 5-field or seconds-first 6-field, UTC.
    #[builder(default = "0 * * * *".to_string(), setter(into))]
    pub schedule: String,
    #[builder(default)]
    pub on_success: OnSuccess,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default)]
    pub metadata: Metadata,
    #[builder(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[builder(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[builder(default)]
    pub run_count: u32,
    #[builder(default)]
    pub error_count: u32,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Result of one job execution. Written once on execution end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub job_id: Uuid,
    pub plugin_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub sources_found: u32,
    pub sources_archived: u32,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl JobExecution {
    pub fn started(job_id: Uuid, plugin_name: impl Into<String>) -> Self {
        Self {
            job_id,
            plugin_name: plugin_name.into(),
            started_at: Utc::now(),
            completed_at: None,
            success: false,
            sources_found: 0,
            sources_archived: 0,
            error: None,
            metadata: Metadata::new(),
        }
    }

    pub fn failed_now(job_id: Uuid, plugin_name: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            plugin_name: plugin_name.into(),
            started_at: now,
            completed_at: Some(now),
            success: false,
            sources_found: 0,
            sources_archived: 0,
            error: Some(error.into()),
            metadata: Metadata::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_success_round_trips_through_str() {
        for policy in [OnSuccess::ArchiveAll, OnSuccess::ArchiveNew, OnSuccess::LogOnly] {
            assert_eq!(policy.as_str().parse::<OnSuccess>().unwrap(), policy);
        }
        assert!("archive_some".parse::<OnSuccess>().is_err());
    }

    #[test]
    fn job_builder_fills_defaults() {
        let job = Job::builder().name("Nightly").plugin_name("DemoPlugin").build();
        assert_eq!(job.schedule, "0 * * * *");
        assert_eq!(job.on_success, OnSuccess::ArchiveNew);
        assert!(job.enabled);
        assert_eq!(job.run_count, 0);
        assert!(job.next_run.is_none());
    }

    #[test]
    fn archive_outcome_constructors() {
        let ok = ArchiveOutcome::ok("/tmp/vid.mp4", 42);
        assert!(ok.success);
        assert_eq!(ok.output_path.as_deref().unwrap().to_str().unwrap(), "/tmp/vid.mp4");

        let failed = ArchiveOutcome::failed("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
