//! Upload: push the artifact (encrypted when present) to content-addressed
//! storage. Enabled by default; progress from the client is republished as
//! `UPLOAD_PROGRESS` events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use haven_events::{Event, EventBus, EventType};

use crate::context::PipelineContext;
use crate::results::{StepError, StepResult};
use crate::services::{ProgressCallback, UploadClient};
use crate::step::{ConditionalStep, PipelineStep};

pub struct UploadStep {
    client: Arc<dyn UploadClient>,
    bus: EventBus,
    default_enabled: bool,
    retry_delay: Duration,
}

impl UploadStep {
    pub fn new(client: Arc<dyn UploadClient>, bus: EventBus, default_enabled: bool) -> Self {
        Self {
            client,
            bus,
            default_enabled,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Override the backoff base; uploads wait longer than other steps by
    /// default.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl ConditionalStep for UploadStep {
    fn enabled_option(&self) -> &str {
        "upload_enabled"
    }

    fn default_enabled(&self) -> bool {
        self.default_enabled
    }
}

#[async_trait]
impl PipelineStep for UploadStep {
    fn name(&self) -> &str {
        "upload"
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    async fn should_skip(&self, ctx: &PipelineContext) -> bool {
        !self.is_enabled(ctx)
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        self.disabled_reason()
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StepResult {
        let path = ctx.working_path().to_path_buf();
        let correlation = ctx.correlation_id();

        self.bus
            .publish(
                Event::new(
                    EventType::UploadRequested,
                    self.name(),
                    json!({ "path": path.display().to_string() }),
                )
                .with_correlation(correlation),
            )
            .await;

        // Progress is awaited inside the client's task; the callback owns
        // only clones and never outlives the upload call.
        let bus = self.bus.clone();
        let on_progress: ProgressCallback<'_> = Box::new(move |stage, percent| {
            let bus = bus.clone();
            let event = Event::new(
                EventType::UploadProgress,
                "upload",
                json!({ "stage": stage, "percent": percent }),
            )
            .with_correlation(correlation);
            Box::pin(async move { bus.publish(event).await })
        });

        match self.client.upload(&path, on_progress).await {
            Ok(upload) => {
                self.bus
                    .publish(
                        Event::new(
                            EventType::UploadComplete,
                            self.name(),
                            json!({
                                "path": path.display().to_string(),
                                "root_cid": upload.root_cid,
                                "piece_cid": upload.piece_cid,
                                "transaction_hash": upload.transaction_hash,
                            }),
                        )
                        .with_correlation(correlation),
                    )
                    .await;

                let mut data = haven_common::Metadata::new();
                data.insert("root_cid".to_string(), json!(upload.root_cid));
                data.insert("piece_cid".to_string(), json!(upload.piece_cid));
                data.insert("transaction_hash".to_string(), json!(upload.transaction_hash));
                ctx.upload_result = Some(upload);
                StepResult::ok_with(self.name(), data)
            }
            Err(e) => {
                self.bus
                    .publish(
                        Event::new(
                            EventType::UploadFailed,
                            self.name(),
                            json!({
                                "path": path.display().to_string(),
                                "error": e.to_string(),
                            }),
                        )
                        .with_correlation(correlation),
                    )
                    .await;
                StepResult::fail(self.name(), StepError::categorized("UPLOAD_ERROR", e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ErrorCategory;
    use crate::testing::ScriptedUploader;
    use haven_events::HistoryFilter;

    #[tokio::test]
    async fn success_records_result_and_progress() {
        let bus = EventBus::new();
        bus.enable_history(100);
        let step = UploadStep::new(Arc::new(ScriptedUploader::new("bafyQ")), bus.clone(), true);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = step.process(&mut ctx).await;

        assert!(result.success());
        assert_eq!(result.content_id(), Some("bafyQ"));
        assert_eq!(ctx.upload_result.as_ref().unwrap().root_cid, "bafyQ");

        let progress = bus.history(HistoryFilter {
            event_type: Some(EventType::UploadProgress),
            ..Default::default()
        });
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].payload["stage"], json!("car"));
        assert_eq!(progress[1].payload["percent"], json!(100));
        assert!(progress
            .iter()
            .all(|e| e.correlation_id == Some(ctx.correlation_id())));
    }

    #[tokio::test]
    async fn transient_failure_is_retryable() {
        let uploader = ScriptedUploader::new("bafyQ").with_failure("503 service unavailable");
        let step = UploadStep::new(Arc::new(uploader), EventBus::new(), true);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = step.process(&mut ctx).await;

        let error = result.error.unwrap();
        assert_eq!(error.category, ErrorCategory::Transient);
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn uploads_encrypted_artifact_when_present() {
        let uploader = Arc::new(ScriptedUploader::new("bafyQ"));
        let step = UploadStep::new(uploader, EventBus::new(), true);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");
        ctx.encrypted_path = Some("/tmp/v.mp4.enc".into());

        let result = step.process(&mut ctx).await;

        assert_eq!(
            ctx.upload_result.as_ref().unwrap().media_path,
            "/tmp/v.mp4.enc"
        );
        assert!(result.success());
    }
}
