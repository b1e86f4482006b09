//! Scripted plugin double for exercising the orchestrator without a real
//! connector. Enabled via the `test-support` feature.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use haven_common::{ArchiveOutcome, MediaSource, Metadata};

use crate::contract::{ArchiverPlugin, Capability, CapabilitySet, PluginError, PluginInfo, Result};

/// A plugin whose discovery and archive behavior is scripted up front.
pub struct ScriptedPlugin {
    name: String,
    capabilities: CapabilitySet,
    sources: Mutex<Vec<MediaSource>>,
    failing_archives: Mutex<HashSet<String>>,
    healthy: AtomicBool,
    fail_init: bool,
    initialized: AtomicBool,
    initialize_calls: AtomicUsize,
    discover_calls: AtomicUsize,
    archive_calls: AtomicUsize,
    archived: Mutex<Vec<String>>,
    config: Mutex<Metadata>,
}

impl ScriptedPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capability::Discover | Capability::Archive | Capability::HealthCheck,
            sources: Mutex::new(Vec::new()),
            failing_archives: Mutex::new(HashSet::new()),
            healthy: AtomicBool::new(true),
            fail_init: false,
            initialized: AtomicBool::new(false),
            initialize_calls: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            archive_calls: AtomicUsize::new(0),
            archived: Mutex::new(Vec::new()),
            config: Mutex::new(Metadata::new()),
        }
    }

    /// Every `discover` call returns these sources.
    pub fn with_sources(self, sources: Vec<MediaSource>) -> Self {
        *self.sources.lock().unwrap() = sources;
        self
    }

    pub fn with_failing_archive(self, source_id: impl Into<String>) -> Self {
        self.failing_archives.lock().unwrap().insert(source_id.into());
        self
    }

    pub fn with_unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn set_sources(&self, sources: Vec<MediaSource>) {
        *self.sources.lock().unwrap() = sources;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn archive_calls(&self) -> usize {
        self.archive_calls.load(Ordering::SeqCst)
    }

    /// Source ids archived so far, in call order.
    pub fn archived_ids(&self) -> Vec<String> {
        self.archived.lock().unwrap().clone()
    }

    pub fn config(&self) -> Metadata {
        self.config.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiverPlugin for ScriptedPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo::new(self.name.clone(), self.capabilities)
    }

    async fn initialize(&self) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(PluginError::Initialization("scripted failure".to_string()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    async fn configure(&self, config: Metadata) {
        self.config.lock().unwrap().extend(config);
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn discover(&self) -> Result<Vec<MediaSource>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sources.lock().unwrap().clone())
    }

    async fn archive(&self, source: &MediaSource) -> Result<ArchiveOutcome> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_archives.lock().unwrap().contains(&source.source_id) {
            return Ok(ArchiveOutcome::failed(format!(
                "scripted archive failure for {}",
                source.source_id
            )));
        }
        self.archived.lock().unwrap().push(source.source_id.clone());
        Ok(ArchiveOutcome::ok(
            format!("/tmp/{}.mp4", source.source_id),
            1024,
        ))
    }
}
