//! Scripted steps and stub services for exercising the pipeline without
//! real media tooling. Enabled via the `test-support` feature.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{AnalysisResult, EncryptionMetadata, PipelineContext, UploadResult};
use crate::results::{StepError, StepResult};
use crate::services::{
    AnalysisEngine, CipherError, CipherService, EncryptionOutput, MediaInspector, MediaProbe,
    ProgressCallback, SyncClient, SyncEntity, SyncError, SyncReceipt, UploadClient,
};
use crate::step::PipelineStep;

/// A step whose results are scripted up front. With no script it succeeds.
pub struct ScriptedStep {
    name: String,
    results: Mutex<VecDeque<StepResult>>,
    always_fail: Option<StepError>,
    skip_reason: Option<String>,
    panic_on_process: bool,
    delay: Option<Duration>,
    max_retries: u32,
    retry_delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: Mutex::new(VecDeque::new()),
            always_fail: None,
            skip_reason: None,
            panic_on_process: false,
            delay: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
        }
    }

    /// Results returned by successive `process` calls; once exhausted the
    /// step succeeds.
    pub fn with_results(self, results: Vec<StepResult>) -> Self {
        *self.results.lock().unwrap() = results.into();
        self
    }

    /// Every `process` call fails with this error.
    pub fn failing_with(mut self, error: StepError) -> Self {
        self.always_fail = Some(error);
        self
    }

    pub fn with_skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn with_panic(mut self) -> Self {
        self.panic_on_process = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn process_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineStep for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    async fn should_skip(&self, _ctx: &PipelineContext) -> bool {
        self.skip_reason.is_some()
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        self.skip_reason.clone().unwrap_or_default()
    }

    async fn process(&self, _ctx: &mut PipelineContext) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_process {
            panic!("scripted step panic");
        }
        if let Some(error) = &self.always_fail {
            return StepResult::fail(&self.name, error.clone());
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StepResult::ok(&self.name))
    }
}

/// Inspector stub with fixed probe results.
pub struct StubInspector {
    pub mime_type: String,
    pub duration_secs: f64,
    pub content_hash: String,
    pub duplicate: bool,
}

impl Default for StubInspector {
    fn default() -> Self {
        Self {
            mime_type: "video/mp4".to_string(),
            duration_secs: 12.5,
            content_hash: "hash_abc123".to_string(),
            duplicate: false,
        }
    }
}

#[async_trait]
impl MediaInspector for StubInspector {
    async fn inspect(&self, _path: &Path) -> anyhow::Result<MediaProbe> {
        Ok(MediaProbe {
            mime_type: self.mime_type.clone(),
            duration_secs: self.duration_secs,
            title: None,
        })
    }

    async fn content_hash(&self, _path: &Path) -> anyhow::Result<String> {
        Ok(self.content_hash.clone())
    }

    async fn is_duplicate(&self, _content_hash: &str) -> anyhow::Result<bool> {
        Ok(self.duplicate)
    }
}

/// Analyzer stub returning one tagged segment.
#[derive(Default)]
pub struct StubAnalyzer;

#[async_trait]
impl AnalysisEngine for StubAnalyzer {
    async fn analyze(&self, path: &Path) -> anyhow::Result<AnalysisResult> {
        let mut tags = std::collections::HashMap::new();
        tags.insert("music".to_string(), 0.9);
        Ok(AnalysisResult {
            media_path: path.display().to_string(),
            segments: Vec::new(),
            tags,
            confidence: 0.9,
        })
    }
}

/// Cipher stub; `missing_credentials` makes every call fail fatally.
#[derive(Default)]
pub struct StubCipher {
    pub missing_credentials: bool,
}

#[async_trait]
impl CipherService for StubCipher {
    async fn encrypt(&self, path: &Path) -> Result<EncryptionOutput, CipherError> {
        if self.missing_credentials {
            return Err(CipherError::CredentialsMissing("no wallet key".to_string()));
        }
        let mut encrypted = path.as_os_str().to_owned();
        encrypted.push(".enc");
        Ok(EncryptionOutput {
            encrypted_path: encrypted.into(),
            metadata: EncryptionMetadata {
                data_hash: "0xdeadbeef".to_string(),
                ..Default::default()
            },
        })
    }
}

/// Uploader that fails a scripted number of times before succeeding, and
/// reports two progress stages on the successful attempt.
pub struct ScriptedUploader {
    failures: Mutex<VecDeque<String>>,
    pub root_cid: String,
    calls: AtomicUsize,
}

impl ScriptedUploader {
    pub fn new(root_cid: impl Into<String>) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            root_cid: root_cid.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue an error for the next call; queued errors are consumed in
    /// order before uploads start succeeding.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.failures.lock().unwrap().push_back(message.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadClient for ScriptedUploader {
    async fn upload(
        &self,
        path: &Path,
        mut on_progress: ProgressCallback<'_>,
    ) -> anyhow::Result<UploadResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failures.lock().unwrap().pop_front() {
            anyhow::bail!(message);
        }
        on_progress("car".to_string(), 50).await;
        on_progress("upload".to_string(), 100).await;
        Ok(UploadResult {
            media_path: path.display().to_string(),
            root_cid: self.root_cid.clone(),
            piece_cid: format!("piece_{}", self.root_cid),
            transaction_hash: "0xfeed".to_string(),
        })
    }
}

/// Sync stub; `out_of_gas` makes every call fail with the structured gas
/// error.
#[derive(Default)]
pub struct StubSyncer {
    pub out_of_gas: bool,
}

#[async_trait]
impl SyncClient for StubSyncer {
    async fn sync_entity(&self, entity: &SyncEntity) -> Result<SyncReceipt, SyncError> {
        if self.out_of_gas {
            return Err(SyncError::InsufficientGas {
                wallet_address: "0xabc".to_string(),
                chain_name: "holesky".to_string(),
                token_symbol: "ETH".to_string(),
            });
        }
        Ok(SyncReceipt {
            entity_key: format!("entity_{}", entity.content_hash),
            transaction_hash: "0xbeef".to_string(),
            is_update: false,
        })
    }
}
