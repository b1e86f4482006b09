//! Step and pipeline result types, error categories, and the shared
//! error-text categorizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haven_common::Metadata;

/// Status of a pipeline step execution.
///
/// Lifecycle: `Pending → Running → (Success | Failed | Skipped | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

/// How a step error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary (network, 5xx, rate limit). Retried with backoff.
    Transient,
    /// Unrecoverable for this input (4xx, invalid data). Fails the step.
    Permanent,
    /// Core setup broken. Stops the whole pipeline immediately.
    Fatal,
    #[default]
    Unknown,
}

/// Detailed error from a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub retryable: bool,
    #[serde(default)]
    pub details: Metadata,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category,
            retryable: category == ErrorCategory::Transient,
            details: Metadata::new(),
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, ErrorCategory::Transient)
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, ErrorCategory::Permanent)
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, ErrorCategory::Fatal)
    }

    pub fn unknown(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, ErrorCategory::Unknown)
    }

    /// Categorize an arbitrary error by its text.
    pub fn categorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let category = categorize_error_text(&message);
        Self::new(code, message, category)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Map error text onto a category. Permanent patterns win over transient
/// ones so a wrapped "invalid api key (connection closed)" is not retried
/// forever.
pub fn categorize_error_text(text: &str) -> ErrorCategory {
    let text = text.to_lowercase();

    const PERMANENT: [&str; 10] = [
        "unauthorized",
        "forbidden",
        "401",
        "403",
        "404",
        "bad request",
        "invalid",
        "not configured",
        "not found",
        "missing",
    ];
    if PERMANENT.iter().any(|p| text.contains(p)) {
        return ErrorCategory::Permanent;
    }

    const TRANSIENT: [&str; 10] = [
        "timeout",
        "connection",
        "network",
        "rate limit",
        "too many requests",
        "502",
        "503",
        "504",
        "temporar",
        "unavailable",
    ];
    if TRANSIENT.iter().any(|p| text.contains(p)) {
        return ErrorCategory::Transient;
    }

    ErrorCategory::Unknown
}

/// Result of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub step_name: String,
    /// Step-specific output data.
    #[serde(default)]
    pub data: Metadata,
    pub error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub attempts: u32,
}

impl StepResult {
    fn bare(status: StepStatus, step_name: impl Into<String>) -> Self {
        Self {
            status,
            step_name: step_name.into(),
            data: Metadata::new(),
            error: None,
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_ms: None,
            attempts: 1,
        }
    }

    pub fn ok(step_name: impl Into<String>) -> Self {
        Self::bare(StepStatus::Success, step_name)
    }

    pub fn ok_with(step_name: impl Into<String>, data: Metadata) -> Self {
        let mut result = Self::bare(StepStatus::Success, step_name);
        result.data = data;
        result
    }

    pub fn fail(step_name: impl Into<String>, error: StepError) -> Self {
        let mut result = Self::bare(StepStatus::Failed, step_name);
        result.error = Some(error);
        result
    }

    pub fn skip(step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::bare(StepStatus::Skipped, step_name);
        result
            .data
            .insert("skip_reason".to_string(), serde_json::Value::String(reason.into()));
        result
    }

    pub fn cancelled(step_name: impl Into<String>) -> Self {
        Self::bare(StepStatus::Cancelled, step_name)
    }

    pub fn success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn skipped(&self) -> bool {
        self.status == StepStatus::Skipped
    }

    /// Content id carried by this result, if any (upload results).
    pub fn content_id(&self) -> Option<&str> {
        self.data
            .get("root_cid")
            .or_else(|| self.data.get("cid"))
            .and_then(|v| v.as_str())
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        self.started_at = Some(started_at);
        self.completed_at = Some(now);
        self.duration_ms = Some((now - started_at).num_milliseconds());
        self
    }
}

/// Aggregate result of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// True iff every step ended in success or skipped.
    pub success: bool,
    pub step_results: Vec<StepResult>,
    pub total_duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_path: String,
    /// Most recent step result carrying a content id.
    pub final_content_id: Option<String>,
    /// First error message, if any step failed.
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn from_steps(
        step_results: Vec<StepResult>,
        source_path: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let success = step_results
            .iter()
            .all(|r| matches!(r.status, StepStatus::Success | StepStatus::Skipped));
        let final_content_id = step_results
            .iter()
            .rev()
            .find_map(|r| r.content_id().map(str::to_string));
        let error = step_results
            .iter()
            .find_map(|r| r.error.as_ref().map(|e| e.message.clone()));

        Self {
            success,
            step_results,
            total_duration_ms: Some((now - started_at).num_milliseconds()),
            started_at: Some(started_at),
            completed_at: Some(now),
            source_path: source_path.into(),
            final_content_id,
            error,
        }
    }

    /// A failed result with no step detail, for errors that escape the
    /// per-step machinery.
    pub fn failed(source_path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            step_results: Vec::new(),
            total_duration_ms: None,
            started_at: None,
            completed_at: Some(Utc::now()),
            source_path: source_path.into(),
            final_content_id: None,
            error: Some(error.into()),
        }
    }

    pub fn step_result(&self, step_name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_name == step_name)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results.iter().filter(|r| r.failed())
    }
}
