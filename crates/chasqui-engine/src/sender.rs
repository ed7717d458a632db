//! Outbound delivery with the persist-then-ack ordering the crash-recovery
//! guarantee needs: each message is stored `pending`, handed to the
//! provider, and confirmed (or failed) before the engine materializes the
//! next one in the same macro-step.

use std::sync::Arc;

use async_trait::async_trait;
use chasqui_core::secrets::SecretStore;
use chasqui_store::types::{Direction, Message, MessageStatus, MessageType, NewMessage};
use chasqui_store::Store;
use chasqui_wire::outbound::{build_payload, preview_text, OutboundMessage};
use chasqui_wire::CloudApiClient;
use tracing::warn;

#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Persist and deliver one outbound message for a conversation,
    /// awaiting the provider acknowledgement. On delivery failure the
    /// stored message is marked `failed` and a system event is appended;
    /// the error is returned so the caller can route `out:error`.
    async fn deliver(
        &self,
        conversation_id: &str,
        msg: &OutboundMessage,
        sent_by: &str,
    ) -> chasqui_core::Result<Message>;
}

pub struct CloudSender {
    store: Arc<Store>,
    client: Arc<CloudApiClient>,
    secrets: SecretStore,
}

impl CloudSender {
    pub fn new(store: Arc<Store>, client: Arc<CloudApiClient>, secrets: SecretStore) -> Self {
        Self {
            store,
            client,
            secrets,
        }
    }
}

#[async_trait]
impl OutboundSender for CloudSender {
    async fn deliver(
        &self,
        conversation_id: &str,
        msg: &OutboundMessage,
        sent_by: &str,
    ) -> chasqui_core::Result<Message> {
        let conversation = self.store.get_conversation(conversation_id)?;
        let connection = self
            .store
            .get_connection(&conversation.channel_connection_id)?
            .ok_or_else(|| {
                chasqui_core::ChasquiError::NotFound(format!(
                    "channel connection {}",
                    conversation.channel_connection_id
                ))
            })?;
        let access_token = connection.access_token(&self.secrets)?;

        let msg_type = match msg {
            OutboundMessage::Text { .. } => MessageType::Text,
            OutboundMessage::Buttons { .. } | OutboundMessage::List { .. } => MessageType::Buttons,
            OutboundMessage::Media { .. } => MessageType::Media,
            OutboundMessage::Template { .. } => MessageType::Template,
        };
        let stored = self.store.append_message(
            conversation_id,
            NewMessage {
                direction: Some(Direction::Out),
                msg_type: Some(msg_type),
                text: Some(preview_text(msg)),
                sent_by: Some(sent_by.to_string()),
                status: Some(MessageStatus::Pending),
                ..Default::default()
            },
        )?;

        let payload = build_payload(&conversation.remote_phone, msg);
        match self
            .client
            .send_message(
                &connection.provider_phone_number_id,
                &access_token,
                &payload,
            )
            .await
        {
            Ok(provider_message_id) => {
                self.store.confirm_sent(&stored.id, &provider_message_id)?;
                Ok(self.store.get_message(&stored.id)?)
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "outbound delivery failed");
                self.store.mark_message_failed(&stored.id)?;
                self.store.append_message(
                    conversation_id,
                    NewMessage::system_event(
                        "send_failed",
                        "No se pudo entregar un mensaje al cliente",
                    ),
                )?;
                Err(e.into())
            }
        }
    }
}
