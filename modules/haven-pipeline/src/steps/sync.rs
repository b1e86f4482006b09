//! Sync: write the archived item's entity to the blockchain sync target.
//! Insufficient-funds errors carry structured details so the admin surface
//! can render an actionable message.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use haven_events::{Event, EventBus, EventType};

use crate::context::PipelineContext;
use crate::results::{StepError, StepResult};
use crate::services::{SyncClient, SyncEntity, SyncError};
use crate::step::{ConditionalStep, PipelineStep};

pub struct SyncStep {
    client: Arc<dyn SyncClient>,
    bus: EventBus,
    default_enabled: bool,
}

impl SyncStep {
    pub fn new(client: Arc<dyn SyncClient>, bus: EventBus, default_enabled: bool) -> Self {
        Self {
            client,
            bus,
            default_enabled,
        }
    }

    fn entity_from(ctx: &PipelineContext) -> SyncEntity {
        let media = ctx.media_metadata.as_ref();
        SyncEntity {
            source_path: ctx.source_path.display().to_string(),
            title: ctx.title(),
            content_hash: media.map(|m| m.content_hash.clone()).unwrap_or_default(),
            root_cid: ctx.content_id().unwrap_or_default().to_string(),
            duration_secs: media.map(|m| m.duration_secs).unwrap_or_default(),
            file_size: media.map(|m| m.file_size).unwrap_or_default(),
            metadata: haven_common::Metadata::new(),
        }
    }
}

impl ConditionalStep for SyncStep {
    fn enabled_option(&self) -> &str {
        "sync_enabled"
    }

    fn default_enabled(&self) -> bool {
        self.default_enabled
    }
}

#[async_trait]
impl PipelineStep for SyncStep {
    fn name(&self) -> &str {
        "sync"
    }

    async fn should_skip(&self, ctx: &PipelineContext) -> bool {
        !self.is_enabled(ctx)
    }

    fn skip_reason(&self, _ctx: &PipelineContext) -> String {
        self.disabled_reason()
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StepResult {
        let path = ctx.source_path.display().to_string();
        self.bus
            .publish(
                Event::new(EventType::SyncRequested, self.name(), json!({ "path": path }))
                    .with_correlation(ctx.correlation_id()),
            )
            .await;

        let entity = Self::entity_from(ctx);
        match self.client.sync_entity(&entity).await {
            Ok(receipt) => {
                ctx.sync_entity_key = Some(receipt.entity_key.clone());
                self.bus
                    .publish(
                        Event::new(
                            EventType::SyncComplete,
                            self.name(),
                            json!({
                                "path": path,
                                "entity_key": receipt.entity_key,
                                "transaction_hash": receipt.transaction_hash,
                                "is_update": receipt.is_update,
                            }),
                        )
                        .with_correlation(ctx.correlation_id()),
                    )
                    .await;

                let mut data = haven_common::Metadata::new();
                data.insert("entity_key".to_string(), json!(receipt.entity_key));
                data.insert("transaction_hash".to_string(), json!(receipt.transaction_hash));
                data.insert("is_update".to_string(), json!(receipt.is_update));
                StepResult::ok_with(self.name(), data)
            }
            Err(SyncError::InsufficientGas {
                wallet_address,
                chain_name,
                token_symbol,
            }) => StepResult::fail(
                self.name(),
                StepError::permanent(
                    "INSUFFICIENT_GAS",
                    format!("insufficient {token_symbol} for wallet {wallet_address} on {chain_name}"),
                )
                .with_detail("wallet_address", json!(wallet_address))
                .with_detail("chain_name", json!(chain_name))
                .with_detail("token_symbol", json!(token_symbol)),
            ),
            Err(SyncError::Other(e)) => {
                StepResult::fail(self.name(), StepError::categorized("SYNC_ERROR", e.to_string()))
            }
        }
    }
}
