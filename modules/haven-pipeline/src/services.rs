//! Service seams for the default steps' external side-effects.
//!
//! The step interfaces and their error semantics are part of the core; the
//! remote-service mechanics behind these traits are not. Production
//! implementations live with their integrations, tests use scripted stubs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use haven_common::Metadata;

use crate::context::{AnalysisResult, EncryptionMetadata, UploadResult};

/// What `MediaInspector::inspect` learns about a file.
#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    pub mime_type: String,
    pub duration_secs: f64,
    pub title: Option<String>,
}

/// Probes media files and detects duplicates by content hash.
#[async_trait]
pub trait MediaInspector: Send + Sync {
    /// Extract technical metadata. Failures here are tolerated by ingest,
    /// which falls back to defaults.
    async fn inspect(&self, path: &Path) -> anyhow::Result<MediaProbe>;

    async fn content_hash(&self, path: &Path) -> anyhow::Result<String>;

    async fn is_duplicate(&self, content_hash: &str) -> anyhow::Result<bool>;
}

/// Runs content analysis (vision-model inference) over a media file.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(&self, path: &Path) -> anyhow::Result<AnalysisResult>;
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Encryption credentials absent at runtime. Fatal to the pipeline.
    #[error("encryption credentials missing: {0}")]
    CredentialsMissing(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct EncryptionOutput {
    pub encrypted_path: PathBuf,
    pub metadata: EncryptionMetadata,
}

/// Credential-gated encryption of an artifact.
#[async_trait]
pub trait CipherService: Send + Sync {
    async fn encrypt(&self, path: &Path) -> Result<EncryptionOutput, CipherError>;
}

/// Progress callback for uploads: `(stage, percent)`. Invoked and awaited
/// in the task that issued the upload; it never outlives the call.
pub type ProgressCallback<'a> = Box<dyn FnMut(String, u8) -> BoxFuture<'static, ()> + Send + 'a>;

/// Content-addressed storage upload.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload(
        &self,
        path: &Path,
        on_progress: ProgressCallback<'_>,
    ) -> anyhow::Result<UploadResult>;
}

/// The entity written to the sync target for one archived item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncEntity {
    pub source_path: String,
    pub title: String,
    pub content_hash: String,
    pub root_cid: String,
    pub duration_secs: f64,
    pub file_size: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct SyncReceipt {
    pub entity_key: String,
    pub transaction_hash: String,
    /// True when an existing entity was updated instead of created.
    pub is_update: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Structured gas error so the user-visible surface can render an
    /// actionable message.
    #[error("insufficient {token_symbol} for wallet {wallet_address} on {chain_name}")]
    InsufficientGas {
        wallet_address: String,
        chain_name: String,
        token_symbol: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Blockchain entity sync.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn sync_entity(&self, entity: &SyncEntity) -> Result<SyncReceipt, SyncError>;
}

/// The injected services the default steps are built over.
#[derive(Clone)]
pub struct PipelineServices {
    pub inspector: Arc<dyn MediaInspector>,
    pub analyzer: Arc<dyn AnalysisEngine>,
    pub cipher: Arc<dyn CipherService>,
    pub uploader: Arc<dyn UploadClient>,
    pub syncer: Arc<dyn SyncClient>,
}
