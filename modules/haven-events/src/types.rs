use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types, ordered roughly by where they occur in the flow:
/// plugin discovery → archive → ingest → analyze → encrypt → upload → sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Plugin events
    SourcesDiscovered,
    ArchiveStarted,
    ArchiveComplete,

    // Pipeline flow events
    VideoIngested,
    AnalysisRequested,
    AnalysisComplete,
    AnalysisFailed,
    EncryptRequested,
    EncryptComplete,
    UploadRequested,
    UploadProgress,
    UploadComplete,
    UploadFailed,
    SyncRequested,
    SyncComplete,

    // Pipeline lifecycle events
    PipelineStarted,
    PipelineComplete,
    PipelineFailed,
    PipelineCancelled,

    // Step lifecycle events
    StepStarted,
    StepComplete,
    StepFailed,
    StepSkipped,

    // System events
    HealthCheck,
    ConfigUpdate,
    WorkerStatus,
}

/// A single event on the bus. The bus never interprets `correlation_id`,
/// only preserves it; handlers must not retain the event past return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            correlation_id: None,
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
