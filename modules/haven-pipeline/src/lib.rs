//! The staged processing pipeline.
//!
//! Each archived file gets a [`PipelineContext`] and flows through an
//! ordered sequence of [`PipelineStep`]s driven by the [`PipelineManager`]:
//! ingest → analyze → encrypt → upload → sync by default. The manager owns
//! retries, error categorization, cancellation, and lifecycle events; steps
//! own their skip predicates and the work itself.

mod builder;
mod context;
mod manager;
mod results;
mod services;
mod step;
pub mod steps;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use builder::PipelineBuilder;
pub use context::{
    AnalysisResult, AnalysisSegment, ContextError, EncryptionMetadata, MediaMetadata,
    PipelineContext, UploadResult,
};
pub use manager::PipelineManager;
pub use results::{categorize_error_text, ErrorCategory, PipelineResult, StepError, StepResult, StepStatus};
pub use services::{
    AnalysisEngine, CipherError, CipherService, EncryptionOutput, MediaInspector, MediaProbe,
    PipelineServices, ProgressCallback, SyncClient, SyncEntity, SyncError, SyncReceipt,
    UploadClient,
};
pub use step::{ConditionalStep, PipelineStep};
