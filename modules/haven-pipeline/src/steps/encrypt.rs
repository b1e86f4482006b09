//! Encrypt: credential-gated encryption of the artifact. Disabled by
//! default; enable per-context with the `encryption_enabled` option.
//! Missing credentials are fatal — downstream steps would otherwise
//! publish plaintext the caller asked to protect.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use haven_events::{Event, EventBus, EventType};

use crate::context::PipelineContext;
use crate::results::{StepError, StepResult};
use crate::services::{CipherError, CipherService};
use crate::step::{ConditionalStep, PipelineStep};

pub struct EncryptStep {
    cipher: Arc<dyn CipherService>,
    bus: EventBus,
    default_enabled: bool,
}

impl EncryptStep {
    pub fn new(cipher: Arc<dyn CipherService>, bus: EventBus, default_enabled: bool) -> Self {
        Self {
            cipher,
            bus,
            default_enabled,
        }
    }
}

impl ConditionalStep for EncryptStep {
    fn enabled_option(&self) -> &str {
        "encryption_enabled"
    }

    fn default_enabled(&self) -> bool {
        self.default_enabled
    }
}

#[async_trait]
impl PipelineStep for EncryptStep {
    fn name(&self) -> &str {
        "encrypt"
    }

    async fn should_skip(&self, ctx: &PipelineContext) -> bool {
        !self.is_enabled(ctx)
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        self.disabled_reason()
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StepResult {
        let path = ctx.source_path.clone();
        self.bus
            .publish(
                Event::new(
                    EventType::EncryptRequested,
                    self.name(),
                    json!({ "path": path.display().to_string() }),
                )
                .with_correlation(ctx.correlation_id()),
            )
            .await;

        match self.cipher.encrypt(&path).await {
            Ok(output) => {
                let encrypted_path = output.encrypted_path.display().to_string();
                let data_hash = output.metadata.data_hash.clone();
                ctx.encryption_metadata = Some(output.metadata);
                ctx.encrypted_path = Some(output.encrypted_path);

                self.bus
                    .publish(
                        Event::new(
                            EventType::EncryptComplete,
                            self.name(),
                            json!({
                                "path": path.display().to_string(),
                                "encrypted_path": encrypted_path,
                            }),
                        )
                        .with_correlation(ctx.correlation_id()),
                    )
                    .await;

                let mut data = haven_common::Metadata::new();
                data.insert("encrypted_path".to_string(), json!(encrypted_path));
                data.insert("data_hash".to_string(), json!(data_hash));
                StepResult::ok_with(self.name(), data)
            }
            Err(CipherError::CredentialsMissing(detail)) => StepResult::fail(
                self.name(),
                StepError::fatal(
                    "ENCRYPTION_SETUP_MISSING",
                    format!("encryption credentials missing: {detail}"),
                ),
            ),
            Err(CipherError::Other(e)) => {
                StepResult::fail(self.name(), StepError::categorized("ENCRYPT_ERROR", e.to_string()))
            }
        }
    }
}
