use chasqui_core::types::ConversationKey;
use serde::{Deserialize, Serialize};

/// Canonical inbound event, decoupled from the provider envelope shape.
/// One webhook POST can carry several of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub key: ConversationKey,
    /// Display number of the receiving business line, when present.
    pub display_number: Option<String>,
    /// Customer profile name from `contacts[].profile.name`.
    pub contact_name: Option<String>,
    pub kind: InboundKind,
    /// Provider message id (`wamid.…`), the dedup key for messages.
    pub provider_message_id: Option<String>,
    /// Provider timestamp, epoch seconds.
    pub provider_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundKind {
    Text {
        body: String,
    },
    Media {
        media: MediaRef,
        media_type: MediaType,
        caption: Option<String>,
    },
    ButtonReply {
        id: String,
        title: String,
    },
    ListReply {
        id: String,
        title: String,
    },
    /// Delivery-state change for an earlier outbound message.
    StatusUpdate {
        status: DeliveryStatus,
    },
    /// A message type the platform does not handle (location, sticker, …).
    Unsupported {
        type_name: String,
    },
}

impl InboundKind {
    /// The text a validation or question node sees for this event.
    pub fn user_text(&self) -> Option<&str> {
        match self {
            InboundKind::Text { body } => Some(body),
            InboundKind::ButtonReply { title, .. } => Some(title),
            InboundKind::ListReply { title, .. } => Some(title),
            _ => None,
        }
    }

    /// The reply id a buttons/menu node matches against.
    pub fn reply_id(&self) -> Option<&str> {
        match self {
            InboundKind::ButtonReply { id, .. } => Some(id),
            InboundKind::ListReply { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Reference to provider-hosted media; the actual bytes stay with the
/// asset-storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub provider_media_id: String,
    pub mime_type: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Document => "document",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }
}
