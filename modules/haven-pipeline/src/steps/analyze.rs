//! Analyze: vision-model inference over the media file. Disabled by
//! default; enable per-context with the `analysis_enabled` option.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use haven_events::{Event, EventBus, EventType};

use crate::context::PipelineContext;
use crate::results::{StepError, StepResult};
use crate::services::AnalysisEngine;
use crate::step::{ConditionalStep, PipelineStep};

pub struct AnalyzeStep {
    engine: Arc<dyn AnalysisEngine>,
    bus: EventBus,
    default_enabled: bool,
}

impl AnalyzeStep {
    pub fn new(engine: Arc<dyn AnalysisEngine>, bus: EventBus, default_enabled: bool) -> Self {
        Self {
            engine,
            bus,
            default_enabled,
        }
    }

    async fn emit(&self, ctx: &PipelineContext, event_type: EventType, payload: serde_json::Value) {
        self.bus
            .publish(Event::new(event_type, self.name(), payload).with_correlation(ctx.correlation_id()))
            .await;
    }
}

impl ConditionalStep for AnalyzeStep {
    fn enabled_option(&self) -> &str {
        "analysis_enabled"
    }

    fn default_enabled(&self) -> bool {
        self.default_enabled
    }
}

#[async_trait]
impl PipelineStep for AnalyzeStep {
    fn name(&self) -> &str {
        "analyze"
    }

    async fn should_skip(&self, ctx: &PipelineContext) -> bool {
        !self.is_enabled(ctx)
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        self.disabled_reason()
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StepResult {
        let path = ctx.source_path.clone();
        self.emit(
            ctx,
            EventType::AnalysisRequested,
            json!({ "path": path.display().to_string() }),
        )
        .await;

        match self.engine.analyze(&path).await {
            Ok(analysis) => {
                let tag_count = analysis.tags.len();
                let confidence = analysis.confidence;
                ctx.analysis_result = Some(analysis);
                self.emit(
                    ctx,
                    EventType::AnalysisComplete,
                    json!({
                        "path": path.display().to_string(),
                        "tag_count": tag_count,
                        "confidence": confidence,
                    }),
                )
                .await;

                let mut data = haven_common::Metadata::new();
                data.insert("tag_count".to_string(), json!(tag_count));
                data.insert("confidence".to_string(), json!(confidence));
                StepResult::ok_with(self.name(), data)
            }
            Err(e) => {
                self.emit(
                    ctx,
                    EventType::AnalysisFailed,
                    json!({
                        "path": path.display().to_string(),
                        "error": e.to_string(),
                    }),
                )
                .await;
                StepResult::fail(self.name(), StepError::categorized("ANALYZE_ERROR", e.to_string()))
            }
        }
    }
}
