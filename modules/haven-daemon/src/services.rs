//! Local service implementations for the composition root.
//!
//! The inspector works against the local filesystem; the remaining
//! services report themselves as not configured until a real integration
//! is wired in, which surfaces as permanent (or, for encryption, fatal)
//! step errors instead of silent no-ops.

use std::path::Path;

use anyhow::bail;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use haven_pipeline::{
    AnalysisEngine, AnalysisResult, CipherError, CipherService, EncryptionOutput, MediaInspector,
    MediaProbe, PipelineServices, ProgressCallback, SyncClient, SyncEntity, SyncError, SyncReceipt,
    UploadClient, UploadResult,
};

/// Inspects files directly on disk. Content hashes are SHA-256 over the
/// file bytes; without a media catalog every hash counts as new.
pub struct FsInspector;

#[async_trait]
impl MediaInspector for FsInspector {
    async fn inspect(&self, path: &Path) -> anyhow::Result<MediaProbe> {
        let mime_type = match path.extension().and_then(|e| e.to_str()) {
            Some("mp4" | "m4v") => "video/mp4",
            Some("mkv") => "video/x-matroska",
            Some("webm") => "video/webm",
            Some("mp3") => "audio/mpeg",
            Some("m4a") => "audio/mp4",
            _ => "application/octet-stream",
        };
        Ok(MediaProbe {
            mime_type: mime_type.to_string(),
            duration_secs: 0.0,
            title: None,
        })
    }

    async fn content_hash(&self, path: &Path) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("{digest:x}"))
    }

    async fn is_duplicate(&self, _content_hash: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub struct UnconfiguredAnalyzer;

#[async_trait]
impl AnalysisEngine for UnconfiguredAnalyzer {
    async fn analyze(&self, _path: &Path) -> anyhow::Result<AnalysisResult> {
        bail!("analysis engine not configured")
    }
}

pub struct UnconfiguredCipher;

#[async_trait]
impl CipherService for UnconfiguredCipher {
    async fn encrypt(&self, _path: &Path) -> Result<EncryptionOutput, CipherError> {
        Err(CipherError::CredentialsMissing(
            "no encryption service configured".to_string(),
        ))
    }
}

pub struct UnconfiguredUploader;

#[async_trait]
impl UploadClient for UnconfiguredUploader {
    async fn upload(
        &self,
        _path: &Path,
        _on_progress: ProgressCallback<'_>,
    ) -> anyhow::Result<UploadResult> {
        bail!("upload client not configured")
    }
}

pub struct UnconfiguredSyncer;

#[async_trait]
impl SyncClient for UnconfiguredSyncer {
    async fn sync_entity(&self, _entity: &SyncEntity) -> Result<SyncReceipt, SyncError> {
        Err(SyncError::Other(anyhow::anyhow!("sync client not configured")))
    }
}

/// The default local service set.
pub fn local_services() -> PipelineServices {
    PipelineServices {
        inspector: std::sync::Arc::new(FsInspector),
        analyzer: std::sync::Arc::new(UnconfiguredAnalyzer),
        cipher: std::sync::Arc::new(UnconfiguredCipher),
        uploader: std::sync::Arc::new(UnconfiguredUploader),
        syncer: std::sync::Arc::new(UnconfiguredSyncer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn fs_inspector_hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"same bytes").unwrap();

        let inspector = FsInspector;
        let first = inspector.content_hash(&path).await.unwrap();
        let second = inspector.content_hash(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        let probe = inspector.inspect(&path).await.unwrap();
        assert_eq!(probe.mime_type, "video/mp4");
    }
}
