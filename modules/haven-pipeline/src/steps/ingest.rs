//! Ingest: validate the archived file, extract metadata, hash it, and
//! flag duplicates. Always runs; everything downstream depends on it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use haven_events::{Event, EventBus, EventType};

use crate::context::{MediaMetadata, PipelineContext};
use crate::results::{StepError, StepResult};
use crate::services::{MediaInspector, MediaProbe};
use crate::step::PipelineStep;

pub struct IngestStep {
    inspector: Arc<dyn MediaInspector>,
    bus: EventBus,
}

impl IngestStep {
    pub fn new(inspector: Arc<dyn MediaInspector>, bus: EventBus) -> Self {
        Self { inspector, bus }
    }
}

#[async_trait]
impl PipelineStep for IngestStep {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StepResult {
        let path = ctx.source_path.clone();

        // Without a readable file nothing downstream can run.
        let file_meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => {
                return StepResult::fail(
                    self.name(),
                    StepError::fatal("FILE_NOT_FOUND", format!("media file not found: {}", path.display()))
                        .with_detail("path", json!(path.display().to_string())),
                );
            }
        };
        if !file_meta.is_file() {
            return StepResult::fail(
                self.name(),
                StepError::fatal("NOT_A_FILE", format!("path is not a file: {}", path.display()))
                    .with_detail("path", json!(path.display().to_string())),
            );
        }
        let file_size = file_meta.len();

        let content_hash = match self.inspector.content_hash(&path).await {
            Ok(hash) => hash,
            Err(e) => {
                return StepResult::fail(self.name(), StepError::categorized("INGEST_ERROR", e.to_string()));
            }
        };

        // Metadata extraction failures are tolerated; ingest continues with
        // defaults.
        let probe = match self.inspector.inspect(&path).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Metadata extraction failed, using defaults");
                MediaProbe::default()
            }
        };

        let is_duplicate = match self.inspector.is_duplicate(&content_hash).await {
            Ok(dup) => dup,
            Err(e) => {
                warn!(error = %e, "Duplicate check failed, assuming new content");
                false
            }
        };
        if is_duplicate {
            ctx.set_step_data(self.name(), "is_duplicate", json!(true));
            if ctx.option_str("duplicate_action") == Some("error") {
                return StepResult::fail(
                    self.name(),
                    StepError::permanent(
                        "DUPLICATE_MEDIA",
                        format!("content with hash {content_hash} already ingested"),
                    ),
                );
            }
        }

        let title = probe.title.clone().unwrap_or_else(|| ctx.title());
        ctx.media_metadata = Some(MediaMetadata {
            path: path.display().to_string(),
            title,
            duration_secs: probe.duration_secs,
            file_size,
            mime_type: probe.mime_type.clone(),
            content_hash: content_hash.clone(),
            source_uri: ctx.option_str("source_uri").unwrap_or_default().to_string(),
        });

        self.bus
            .publish(
                Event::new(
                    EventType::VideoIngested,
                    self.name(),
                    json!({
                        "path": path.display().to_string(),
                        "content_hash": content_hash,
                        "file_size": file_size,
                        "duration": probe.duration_secs,
                        "is_duplicate": is_duplicate,
                        "mime_type": probe.mime_type,
                    }),
                )
                .with_correlation(ctx.correlation_id()),
            )
            .await;

        let mut data = haven_common::Metadata::new();
        data.insert("content_hash".to_string(), json!(content_hash));
        data.insert("file_size".to_string(), json!(file_size));
        data.insert("duration".to_string(), json!(probe.duration_secs));
        data.insert("mime_type".to_string(), json!(probe.mime_type));
        data.insert("is_duplicate".to_string(), json!(is_duplicate));
        StepResult::ok_with(self.name(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ErrorCategory;
    use crate::testing::StubInspector;
    use std::io::Write;

    fn step_with(inspector: StubInspector) -> (IngestStep, EventBus) {
        let bus = EventBus::new();
        bus.enable_history(100);
        (IngestStep::new(Arc::new(inspector), bus.clone()), bus)
    }

    fn media_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("clip.mp4");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"not really a video").unwrap();
        path
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let (step, _bus) = step_with(StubInspector::default());
        let mut ctx = PipelineContext::new("/nowhere/clip.mp4");

        let result = step.process(&mut ctx).await;

        let error = result.error.unwrap();
        assert_eq!(error.code, "FILE_NOT_FOUND");
        assert_eq!(error.category, ErrorCategory::Fatal);
    }

    #[tokio::test]
    async fn populates_metadata_and_emits_ingested() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir);
        let (step, bus) = step_with(StubInspector::default());
        let mut ctx = PipelineContext::new(&path);

        let result = step.process(&mut ctx).await;

        assert!(result.success());
        let meta = ctx.media_metadata.as_ref().unwrap();
        assert_eq!(meta.content_hash, "hash_abc123");
        assert_eq!(meta.mime_type, "video/mp4");
        assert_eq!(meta.file_size, 18);

        let history = bus.history(haven_events::HistoryFilter {
            event_type: Some(EventType::VideoIngested),
            ..Default::default()
        });
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].correlation_id, Some(ctx.correlation_id()));
        assert_eq!(history[0].payload["is_duplicate"], json!(false));
    }

    #[tokio::test]
    async fn duplicate_with_error_action_fails_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir);
        let inspector = StubInspector {
            duplicate: true,
            ..Default::default()
        };
        let (step, _bus) = step_with(inspector);

        let mut options = haven_common::Metadata::new();
        options.insert("duplicate_action".to_string(), json!("error"));
        let mut ctx = PipelineContext::new(&path).with_options(options);

        let result = step.process(&mut ctx).await;

        let error = result.error.unwrap();
        assert_eq!(error.code, "DUPLICATE_MEDIA");
        assert_eq!(error.category, ErrorCategory::Permanent);
        assert_eq!(ctx.get_step_data("ingest", "is_duplicate"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn duplicate_continues_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir);
        let inspector = StubInspector {
            duplicate: true,
            ..Default::default()
        };
        let (step, _bus) = step_with(inspector);
        let mut ctx = PipelineContext::new(&path);

        let result = step.process(&mut ctx).await;

        assert!(result.success());
        assert_eq!(result.data["is_duplicate"], json!(true));
    }
}
