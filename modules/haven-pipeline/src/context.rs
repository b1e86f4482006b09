//! The per-work-item container that flows through the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use haven_common::Metadata;

/// Metadata extracted from the media file during ingest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub path: String,
    pub title: String,
    pub duration_secs: f64,
    pub file_size: u64,
    pub mime_type: String,
    /// Content hash used for duplicate detection.
    pub content_hash: String,
    pub source_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSegment {
    pub tag: String,
    pub start_secs: f64,
    pub end_secs: Option<f64>,
    pub confidence: f64,
}

/// Result of content analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub media_path: String,
    pub segments: Vec<AnalysisSegment>,
    /// Tag name → aggregate score.
    pub tags: HashMap<String, f64>,
    pub confidence: f64,
}

/// Metadata about credential-gated encryption of the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub data_hash: String,
    pub access_control_conditions: Vec<serde_json::Value>,
    pub chain: String,
}

impl Default for EncryptionMetadata {
    fn default() -> Self {
        Self {
            data_hash: String::new(),
            access_control_conditions: Vec::new(),
            chain: "ethereum".to_string(),
        }
    }
}

/// Result of the content-addressed upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadResult {
    pub media_path: String,
    pub root_cid: String,
    pub piece_cid: String,
    pub transaction_hash: String,
}

/// One entry in the context's error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextError {
    pub step: String,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Metadata,
}

/// Mutable state for one work item. Exclusively owned by the task
/// processing it; the correlation id ties every emitted event back to it.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub context_id: Uuid,
    pub source_path: PathBuf,
    /// Pipeline options (step toggles, job metadata, source metadata).
    pub options: Metadata,

    // Accumulated stage outputs
    pub media_metadata: Option<MediaMetadata>,
    pub analysis_result: Option<AnalysisResult>,
    pub encryption_metadata: Option<EncryptionMetadata>,
    /// When set, downstream steps operate on this file instead of
    /// `source_path`.
    pub encrypted_path: Option<PathBuf>,
    pub upload_result: Option<UploadResult>,
    pub sync_entity_key: Option<String>,

    pub errors: Vec<ContextError>,
    /// Per-step scratch space, namespaced by step name.
    pub step_data: HashMap<String, Metadata>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    cancelled: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            context_id: Uuid::new_v4(),
            source_path: source_path.into(),
            options: Metadata::new(),
            media_metadata: None,
            analysis_result: None,
            encryption_metadata: None,
            encrypted_path: None,
            upload_result: None,
            sync_entity_key: None,
            errors: Vec::new(),
            step_data: HashMap::new(),
            created_at: now,
            updated_at: now,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: Metadata) -> Self {
        self.options = options;
        self
    }

    /// Correlation id carried by every event emitted for this context.
    pub fn correlation_id(&self) -> Uuid {
        self.context_id
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn title(&self) -> String {
        if let Some(meta) = &self.media_metadata {
            if !meta.title.is_empty() {
                return meta.title.clone();
            }
        }
        self.source_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The file downstream steps should read: the encrypted artifact when
    /// present, else the source.
    pub fn working_path(&self) -> &Path {
        self.encrypted_path.as_deref().unwrap_or(&self.source_path)
    }

    /// Boolean option lookup; anything other than a JSON boolean falls back
    /// to `default`.
    pub fn option_flag(&self, key: &str, default: bool) -> bool {
        self.options.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_step_data(&mut self, step_name: &str, key: impl Into<String>, value: serde_json::Value) {
        self.step_data
            .entry(step_name.to_string())
            .or_default()
            .insert(key.into(), value);
        self.touch();
    }

    pub fn get_step_data(&self, step_name: &str, key: &str) -> Option<&serde_json::Value> {
        self.step_data.get(step_name).and_then(|data| data.get(key))
    }

    pub fn add_error(&mut self, step: &str, code: &str, message: &str, details: Metadata) {
        self.errors.push(ContextError {
            step: step.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            details,
        });
        self.touch();
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Uploaded content id, once the upload step has run.
    pub fn content_id(&self) -> Option<&str> {
        self.upload_result
            .as_ref()
            .map(|r| r.root_cid.as_str())
            .filter(|cid| !cid.is_empty())
    }

    // Cancellation. The flag is shared with the manager's in-flight
    // registry; steps observe it at their own suspension points.

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_falls_back_to_file_stem() {
        let mut ctx = PipelineContext::new("/archive/clip_01.mp4");
        assert_eq!(ctx.title(), "clip_01");
        assert_eq!(ctx.file_name(), "clip_01.mp4");

        ctx.media_metadata = Some(MediaMetadata {
            title: "A better title".to_string(),
            ..Default::default()
        });
        assert_eq!(ctx.title(), "A better title");
    }

    #[test]
    fn option_flag_handles_missing_and_nonbool() {
        let mut options = Metadata::new();
        options.insert("analysis_enabled".to_string(), serde_json::json!(true));
        options.insert("weird".to_string(), serde_json::json!("yes"));
        let ctx = PipelineContext::new("/tmp/v.mp4").with_options(options);

        assert!(ctx.option_flag("analysis_enabled", false));
        assert!(!ctx.option_flag("missing", false));
        assert!(ctx.option_flag("missing", true));
        assert!(!ctx.option_flag("weird", false));
    }

    #[test]
    fn step_data_is_namespaced_by_step() {
        let mut ctx = PipelineContext::new("/tmp/v.mp4");
        ctx.set_step_data("ingest", "is_duplicate", serde_json::json!(true));

        assert_eq!(
            ctx.get_step_data("ingest", "is_duplicate"),
            Some(&serde_json::json!(true))
        );
        assert!(ctx.get_step_data("upload", "is_duplicate").is_none());
    }

    #[test]
    fn working_path_prefers_encrypted_artifact() {
        let mut ctx = PipelineContext::new("/tmp/v.mp4");
        assert_eq!(ctx.working_path(), Path::new("/tmp/v.mp4"));
        ctx.encrypted_path = Some(PathBuf::from("/tmp/v.mp4.enc"));
        assert_eq!(ctx.working_path(), Path::new("/tmp/v.mp4.enc"));
    }
}
