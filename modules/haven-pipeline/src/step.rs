//! The pipeline step contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::results::{StepError, StepResult};

/// One stage of the pipeline.
///
/// `process` is the only required method and must not retry itself; the
/// [`PipelineManager`](crate::PipelineManager) drives retries using
/// `max_retries` and `retry_delay`. Lifecycle hooks default to no-ops.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Stable step identifier, used for events and the context error log.
    fn name(&self) -> &str;

    /// Total attempts allowed for retryable failures.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Base delay for exponential backoff between attempts.
    fn retry_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn should_skip(&self, _ctx: &PipelineContext) -> bool {
        false
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        "condition not met".to_string()
    }

    /// The step's core logic. Returns a success, failure, or skip result;
    /// never panics by contract (panics are still contained by the manager
    /// and converted to unknown-category failures).
    async fn process(&self, ctx: &mut PipelineContext) -> StepResult;

    async fn on_start(&self, _ctx: &mut PipelineContext) {}

    async fn on_complete(&self, _ctx: &mut PipelineContext, _result: &StepResult) {}

    async fn on_error(&self, _ctx: &mut PipelineContext, _error: &StepError) {}

    async fn on_skip(&self, _ctx: &mut PipelineContext, _reason: &str) {}
}

/// Convenience for steps gated by a boolean context option: the step skips
/// iff `ctx.options[enabled_option]` is falsy.
pub trait ConditionalStep {
    /// Name of the context option that enables this step.
    fn enabled_option(&self) -> &str;

    fn default_enabled(&self) -> bool {
        true
    }

    fn is_enabled(&self, ctx: &PipelineContext) -> bool {
        ctx.option_flag(self.enabled_option(), self.default_enabled())
    }

    fn disabled_reason(&self) -> String {
        format!("{} is disabled", self.enabled_option())
    }
}
