//! Fluent construction of the default pipeline.

use std::sync::Arc;

use haven_events::EventBus;

use crate::manager::PipelineManager;
use crate::services::PipelineServices;
use crate::step::PipelineStep;
use crate::steps::{AnalyzeStep, EncryptStep, IngestStep, SyncStep, UploadStep};

/// Composes the default ordering ingest → analyze → encrypt → upload →
/// sync, with a per-step toggle that sets its default-enabled state.
/// Contexts can still flip any step via their options.
pub struct PipelineBuilder {
    services: PipelineServices,
    bus: EventBus,
    max_concurrent: usize,
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl PipelineBuilder {
    pub fn new(services: PipelineServices, bus: EventBus) -> Self {
        Self {
            services,
            bus,
            max_concurrent: 4,
            steps: Vec::new(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Append a custom step at the current position.
    pub fn with_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_ingest(mut self) -> Self {
        self.steps.push(Arc::new(IngestStep::new(
            self.services.inspector.clone(),
            self.bus.clone(),
        )));
        self
    }

    pub fn with_analysis(mut self, enabled: bool) -> Self {
        self.steps.push(Arc::new(AnalyzeStep::new(
            self.services.analyzer.clone(),
            self.bus.clone(),
            enabled,
        )));
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.steps.push(Arc::new(EncryptStep::new(
            self.services.cipher.clone(),
            self.bus.clone(),
            enabled,
        )));
        self
    }

    pub fn with_upload(mut self, enabled: bool) -> Self {
        self.steps.push(Arc::new(UploadStep::new(
            self.services.uploader.clone(),
            self.bus.clone(),
            enabled,
        )));
        self
    }

    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.steps.push(Arc::new(SyncStep::new(
            self.services.syncer.clone(),
            self.bus.clone(),
            enabled,
        )));
        self
    }

    /// The full default pipeline: ingest always runs, upload defaults on,
    /// analysis/encryption/sync default off.
    pub fn with_default_steps(self) -> Self {
        self.with_ingest()
            .with_analysis(false)
            .with_encryption(false)
            .with_upload(true)
            .with_sync(false)
    }

    pub fn build(self) -> PipelineManager {
        let mut manager = PipelineManager::new(self.max_concurrent, self.bus);
        for step in self.steps {
            manager.register_step(step);
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedUploader, StubAnalyzer, StubCipher, StubInspector, StubSyncer};

    fn stub_services() -> PipelineServices {
        PipelineServices {
            inspector: Arc::new(StubInspector::default()),
            analyzer: Arc::new(StubAnalyzer),
            cipher: Arc::new(StubCipher::default()),
            uploader: Arc::new(ScriptedUploader::new("bafyQ")),
            syncer: Arc::new(StubSyncer::default()),
        }
    }

    #[test]
    fn default_steps_are_ordered() {
        let manager = PipelineBuilder::new(stub_services(), EventBus::new())
            .with_default_steps()
            .build();
        assert_eq!(
            manager.step_names(),
            vec!["ingest", "analyze", "encrypt", "upload", "sync"]
        );
    }

    #[test]
    fn custom_steps_interleave_with_defaults() {
        let manager = PipelineBuilder::new(stub_services(), EventBus::new())
            .with_ingest()
            .with_step(Arc::new(crate::testing::ScriptedStep::new("transcode")))
            .with_upload(true)
            .build();
        assert_eq!(manager.step_names(), vec!["ingest", "transcode", "upload"]);
    }
}
