//! Drives the ordered step sequence for each context.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use haven_events::{Event, EventBus, EventType};

use crate::context::PipelineContext;
use crate::results::{ErrorCategory, PipelineResult, StepError, StepResult, StepStatus};
use crate::step::PipelineStep;

struct InFlight {
    cancel: Arc<AtomicBool>,
    source_path: String,
}

/// Orchestrates a fixed ordered sequence of steps per context and bounds
/// concurrent pipeline executions with a semaphore.
pub struct PipelineManager {
    steps: Vec<Arc<dyn PipelineStep>>,
    semaphore: Arc<Semaphore>,
    bus: EventBus,
    active: Mutex<HashMap<Uuid, InFlight>>,
}

impl PipelineManager {
    pub fn new(max_concurrent: usize, bus: EventBus) -> Self {
        Self {
            steps: Vec::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            bus,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register a step. Steps execute in registration order.
    pub fn register_step(&mut self, step: Arc<dyn PipelineStep>) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Run every registered step against one context.
    ///
    /// Steps run strictly in order; a step's lifecycle (success, fail, or
    /// skip) ends before the next begins. A fatal step error stops the
    /// pipeline immediately. The aggregate succeeds iff every step ended
    /// in success or skipped.
    pub async fn process(&self, ctx: &mut PipelineContext) -> PipelineResult {
        let started_at = Utc::now();
        let correlation = ctx.correlation_id();
        let path = ctx.source_path.display().to_string();

        self.active.lock().unwrap().insert(
            correlation,
            InFlight {
                cancel: ctx.cancel_flag(),
                source_path: path.clone(),
            },
        );

        self.emit(
            EventType::PipelineStarted,
            "pipeline_manager",
            correlation,
            json!({ "path": path, "steps": self.step_names() }),
        )
        .await;

        let mut step_results: Vec<StepResult> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if ctx.is_cancelled() {
                step_results.push(StepResult::cancelled(step.name()));
                break;
            }

            if step.should_skip(ctx).await {
                let reason = step.skip_reason(ctx);
                step.on_skip(ctx, &reason).await;
                self.emit(
                    EventType::StepSkipped,
                    step.name(),
                    correlation,
                    json!({ "step_name": step.name(), "reason": reason }),
                )
                .await;
                step_results.push(StepResult::skip(step.name(), reason));
                continue;
            }

            let result = self.run_step(step.as_ref(), ctx).await;
            let fatal = result
                .error
                .as_ref()
                .is_some_and(|e| e.category == ErrorCategory::Fatal);
            step_results.push(result);
            if fatal {
                warn!(path = %path, step = step.name(), "Fatal step error, stopping pipeline");
                break;
            }
        }

        self.active.lock().unwrap().remove(&correlation);

        let cancelled = step_results
            .iter()
            .any(|r| r.status == StepStatus::Cancelled);
        let result = PipelineResult::from_steps(step_results, &path, started_at);

        if cancelled {
            // PIPELINE_CANCELLED was already emitted by cancel().
            return result;
        }

        if result.success {
            info!(path = %path, cid = ?result.final_content_id, "Pipeline complete");
            self.emit(
                EventType::PipelineComplete,
                "pipeline_manager",
                correlation,
                json!({
                    "path": path,
                    "cid": result.final_content_id,
                    "duration_ms": result.total_duration_ms,
                }),
            )
            .await;
        } else {
            let failed: Vec<&str> = result.failed_steps().map(|r| r.step_name.as_str()).collect();
            warn!(path = %path, error = ?result.error, "Pipeline failed");
            self.emit(
                EventType::PipelineFailed,
                "pipeline_manager",
                correlation,
                json!({
                    "path": path,
                    "error": result.error,
                    "failed_steps": failed,
                }),
            )
            .await;
        }

        result
    }

    /// Run one step with lifecycle hooks, events, and the retry loop.
    async fn run_step(&self, step: &dyn PipelineStep, ctx: &mut PipelineContext) -> StepResult {
        let name = step.name().to_string();
        let correlation = ctx.correlation_id();
        let started_at = Utc::now();

        self.emit(
            EventType::StepStarted,
            &name,
            correlation,
            json!({ "step_name": name }),
        )
        .await;
        step.on_start(ctx).await;

        let max_retries = step.max_retries().max(1);
        let mut attempts = 0u32;
        let mut last_error: Option<StepError> = None;

        while attempts < max_retries {
            attempts += 1;

            let result = match AssertUnwindSafe(step.process(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => StepResult::fail(
                    &name,
                    StepError::unknown(
                        format!("{}_PANIC", name.to_uppercase()),
                        panic_message(panic),
                    ),
                ),
            };

            if result.success() {
                let mut result = result.with_timing(started_at);
                result.attempts = attempts;
                step.on_complete(ctx, &result).await;
                self.emit(
                    EventType::StepComplete,
                    &name,
                    correlation,
                    json!({
                        "step_name": name,
                        "duration_ms": result.duration_ms,
                        "data": result.data,
                    }),
                )
                .await;
                return result;
            }

            let error = result.error.clone().unwrap_or_else(|| {
                StepError::permanent(
                    format!("{}_FAILED", name.to_uppercase()),
                    "step failed without specific error",
                )
            });

            let retry = error.retryable && attempts < max_retries;
            last_error = Some(error);
            if retry {
                let backoff = step.retry_delay() * 2u32.pow(attempts - 1);
                tokio::time::sleep(backoff).await;
                continue;
            }
            break;
        }

        // Retries exhausted or non-retryable error.
        let error = last_error.unwrap_or_else(|| {
            StepError::permanent(
                format!("{}_FAILED", name.to_uppercase()),
                "step failed without specific error",
            )
        });
        let mut result = StepResult::fail(&name, error.clone()).with_timing(started_at);
        result.attempts = attempts;

        ctx.add_error(&name, &error.code, &error.message, error.details.clone());
        step.on_error(ctx, &error).await;
        self.emit(
            EventType::StepFailed,
            &name,
            correlation,
            json!({
                "step_name": name,
                "error_code": error.code,
                "error_message": error.message,
                "attempts": attempts,
            }),
        )
        .await;

        result
    }

    /// Process many contexts concurrently, bounded by the pipeline gate.
    /// Results come back in input order; anything that escapes a pipeline
    /// becomes a failed result rather than bubbling.
    pub async fn process_batch(&self, contexts: Vec<PipelineContext>) -> Vec<PipelineResult> {
        let tasks = contexts.into_iter().map(|mut ctx| {
            let semaphore = self.semaphore.clone();
            async move {
                let path = ctx.source_path.display().to_string();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return PipelineResult::failed(path, "pipeline gate closed"),
                };
                match AssertUnwindSafe(self.process(&mut ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => PipelineResult::failed(path, panic_message(panic)),
                }
            }
        });
        join_all(tasks).await
    }

    /// Cooperatively cancel an in-flight pipeline. The flag is observed
    /// between steps and at step suspension points.
    pub async fn cancel(&self, correlation_id: Uuid) -> bool {
        let entry = {
            let active = self.active.lock().unwrap();
            active
                .get(&correlation_id)
                .map(|e| (e.cancel.clone(), e.source_path.clone()))
        };

        match entry {
            Some((flag, path)) => {
                flag.store(true, Ordering::SeqCst);
                self.emit(
                    EventType::PipelineCancelled,
                    "pipeline_manager",
                    correlation_id,
                    json!({ "path": path }),
                )
                .await;
                true
            }
            None => false,
        }
    }

    async fn emit(
        &self,
        event_type: EventType,
        source: &str,
        correlation: Uuid,
        payload: serde_json::Value,
    ) {
        self.bus
            .publish(Event::new(event_type, source, payload).with_correlation(correlation))
            .await;
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ErrorCategory;
    use crate::testing::ScriptedStep;
    use haven_events::HistoryFilter;
    use std::time::{Duration, Instant};

    fn manager_with(steps: Vec<ScriptedStep>) -> PipelineManager {
        let bus = EventBus::new();
        bus.enable_history(1000);
        let mut manager = PipelineManager::new(4, bus);
        for step in steps {
            manager.register_step(Arc::new(step));
        }
        manager
    }

    fn event_types(manager: &PipelineManager) -> Vec<EventType> {
        manager
            .event_bus()
            .history(HistoryFilter::default())
            .iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_aggregates_success() {
        let manager = manager_with(vec![
            ScriptedStep::new("ingest"),
            ScriptedStep::new("upload"),
        ]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(result.success);
        let names: Vec<&str> = result.step_results.iter().map(|r| r.step_name.as_str()).collect();
        assert_eq!(names, vec!["ingest", "upload"]);
        assert_eq!(
            event_types(&manager),
            vec![
                EventType::PipelineStarted,
                EventType::StepStarted,
                EventType::StepComplete,
                EventType::StepStarted,
                EventType::StepComplete,
                EventType::PipelineComplete,
            ]
        );
    }

    #[tokio::test]
    async fn every_event_carries_the_context_correlation_id() {
        let manager = manager_with(vec![ScriptedStep::new("ingest")]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        manager.process(&mut ctx).await;

        let history = manager.event_bus().history(HistoryFilter::default());
        assert!(!history.is_empty());
        assert!(history
            .iter()
            .all(|e| e.correlation_id == Some(ctx.correlation_id())));
    }

    #[tokio::test]
    async fn transient_error_retries_with_backoff() {
        let step = ScriptedStep::new("upload")
            .with_retry(3, Duration::from_millis(20))
            .with_results(vec![
                StepResult::fail("upload", StepError::transient("UPLOAD_ERROR", "503 unavailable")),
                StepResult::ok("upload"),
            ]);
        let manager = manager_with(vec![step]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let started = Instant::now();
        let result = manager.process(&mut ctx).await;

        assert!(result.success);
        let upload = result.step_result("upload").unwrap();
        assert_eq!(upload.attempts, 2);
        // First retry sleeps at least the base delay.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn retries_stop_at_max_and_record_error() {
        let step = ScriptedStep::new("upload")
            .with_retry(3, Duration::from_millis(1))
            .failing_with(StepError::transient("UPLOAD_ERROR", "503 unavailable"));
        let manager = manager_with(vec![step]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(!result.success);
        let upload = result.step_result("upload").unwrap();
        assert_eq!(upload.attempts, 3);
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].code, "UPLOAD_ERROR");
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let step = ScriptedStep::new("upload")
            .with_retry(3, Duration::from_millis(1))
            .failing_with(StepError::permanent("UPLOAD_ERROR", "404 not found"));
        let manager = manager_with(vec![step, ScriptedStep::new("sync")]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(!result.success);
        assert_eq!(result.step_result("upload").unwrap().attempts, 1);
        // A non-fatal failure does not stop later steps.
        assert!(result.step_result("sync").unwrap().success());
    }

    #[tokio::test]
    async fn fatal_error_halts_the_pipeline() {
        let step = ScriptedStep::new("ingest")
            .failing_with(StepError::fatal("FILE_NOT_FOUND", "media file not found"));
        let manager = manager_with(vec![
            step,
            ScriptedStep::new("analyze"),
            ScriptedStep::new("upload"),
        ]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(!result.success);
        assert_eq!(result.step_results.len(), 1);

        // No STEP_STARTED for anything after the fatal step.
        let started: Vec<String> = manager
            .event_bus()
            .history(HistoryFilter {
                event_type: Some(EventType::StepStarted),
                ..Default::default()
            })
            .iter()
            .map(|e| e.payload["step_name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["ingest"]);
    }

    #[tokio::test]
    async fn skipped_step_emits_skip_event_and_continues() {
        let manager = manager_with(vec![
            ScriptedStep::new("analyze").with_skip("analysis_enabled is disabled"),
            ScriptedStep::new("upload"),
        ]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(result.success);
        assert!(result.step_result("analyze").unwrap().skipped());
        assert!(result.step_result("upload").unwrap().success());
        assert!(event_types(&manager).contains(&EventType::StepSkipped));
    }

    #[tokio::test]
    async fn panicking_step_becomes_unknown_failure() {
        let manager = manager_with(vec![ScriptedStep::new("ingest").with_panic()]);
        let mut ctx = PipelineContext::new("/tmp/v.mp4");

        let result = manager.process(&mut ctx).await;

        assert!(!result.success);
        let error = result.step_result("ingest").unwrap().error.clone().unwrap();
        assert_eq!(error.category, ErrorCategory::Unknown);
        assert_eq!(error.code, "INGEST_PANIC");
    }

    #[tokio::test]
    async fn batch_returns_results_in_input_order() {
        let manager = manager_with(vec![ScriptedStep::new("ingest")]);
        let contexts: Vec<PipelineContext> = (0..8)
            .map(|n| PipelineContext::new(format!("/tmp/v{n}.mp4")))
            .collect();
        let expected: Vec<String> = contexts
            .iter()
            .map(|c| c.source_path.display().to_string())
            .collect();

        let results = manager.process_batch(contexts).await;

        let got: Vec<String> = results.iter().map(|r| r.source_path.clone()).collect();
        assert_eq!(got, expected);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn cancel_stops_remaining_steps() {
        let bus = EventBus::new();
        bus.enable_history(100);
        let mut manager = PipelineManager::new(4, bus);
        manager.register_step(Arc::new(
            ScriptedStep::new("ingest").with_delay(Duration::from_millis(50)),
        ));
        manager.register_step(Arc::new(ScriptedStep::new("upload")));
        let manager = Arc::new(manager);

        let mut ctx = PipelineContext::new("/tmp/v.mp4");
        let correlation = ctx.correlation_id();

        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let result = manager.process(&mut ctx).await;
                (result, ctx)
            })
        };

        // Let the first step start, then cancel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.cancel(correlation).await);

        let (result, _ctx) = runner.await.unwrap();
        assert!(!result.success);
        // ingest finished, upload was cancelled before starting.
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.step_results[1].status, StepStatus::Cancelled);
        assert!(event_types(&manager).contains(&EventType::PipelineCancelled));
        assert!(!event_types(&manager).contains(&EventType::PipelineFailed));

        // Cancelling an unknown pipeline reports false.
        assert!(!manager.cancel(Uuid::new_v4()).await);
    }
}
