//! Inbound webhook envelope, the Cloud API's `object/entry/changes/value`
//! nesting, and its flattening into canonical [`InboundEvent`]s.

use chasqui_core::types::ConversationKey;
use serde::Deserialize;
use tracing::warn;

use crate::event::{DeliveryStatus, InboundEvent, InboundKind, MediaRef, MediaType};

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    pub field: String,
    pub value: ChangeValue,
}

#[derive(Debug, Deserialize)]
pub struct ChangeValue {
    pub messaging_product: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<WaMessage>,
    #[serde(default)]
    pub statuses: Vec<WaStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metadata {
    pub display_phone_number: Option<String>,
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Contact {
    pub wa_id: String,
    pub profile: Profile,
}

#[derive(Debug, Deserialize)]
pub struct Profile {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WaMessage {
    pub id: String,
    pub from: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<WaText>,
    #[serde(default)]
    pub image: Option<WaMedia>,
    #[serde(default)]
    pub audio: Option<WaMedia>,
    #[serde(default)]
    pub video: Option<WaMedia>,
    #[serde(default)]
    pub document: Option<WaMedia>,
    #[serde(default)]
    pub interactive: Option<WaInteractive>,
    #[serde(default)]
    pub button: Option<WaButton>,
}

#[derive(Debug, Deserialize)]
pub struct WaText {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WaMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaInteractive {
    #[serde(rename = "type")]
    pub interactive_type: String,
    #[serde(default)]
    pub button_reply: Option<WaReply>,
    #[serde(default)]
    pub list_reply: Option<WaReply>,
}

#[derive(Debug, Deserialize)]
pub struct WaReply {
    pub id: String,
    pub title: String,
}

/// Legacy template quick-reply button.
#[derive(Debug, Deserialize)]
pub struct WaButton {
    pub payload: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct WaStatus {
    pub id: String,
    pub status: String,
    pub timestamp: String,
    pub recipient_id: String,
}

/// Flatten a webhook envelope into canonical events.
///
/// Entries whose metadata carries no `phone_number_id` are skipped (there
/// is no conversation to attach them to); unknown message types surface as
/// `InboundKind::Unsupported`, never as parse errors.
pub fn parse_envelope(envelope: &WebhookEnvelope) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    for entry in &envelope.entry {
        for change in &entry.changes {
            if change.field != "messages" {
                continue;
            }
            let value = &change.value;
            let Some(phone_number_id) = value.metadata.phone_number_id.as_deref() else {
                warn!(entry_id = %entry.id, "webhook change without phone_number_id, skipping");
                continue;
            };

            for msg in &value.messages {
                let contact_name = value
                    .contacts
                    .iter()
                    .find(|c| c.wa_id == msg.from)
                    .map(|c| c.profile.name.clone());

                events.push(InboundEvent {
                    key: ConversationKey::new(phone_number_id, msg.from.clone()),
                    display_number: value.metadata.display_phone_number.clone(),
                    contact_name,
                    kind: classify_message(msg),
                    provider_message_id: Some(msg.id.clone()),
                    provider_timestamp: msg.timestamp.parse().ok(),
                });
            }

            for status in &value.statuses {
                let Some(parsed) = DeliveryStatus::parse(&status.status) else {
                    warn!(status = %status.status, "unknown delivery status, skipping");
                    continue;
                };
                events.push(InboundEvent {
                    key: ConversationKey::new(phone_number_id, status.recipient_id.clone()),
                    display_number: value.metadata.display_phone_number.clone(),
                    contact_name: None,
                    kind: InboundKind::StatusUpdate { status: parsed },
                    provider_message_id: Some(status.id.clone()),
                    provider_timestamp: status.timestamp.parse().ok(),
                });
            }
        }
    }

    events
}

fn classify_message(msg: &WaMessage) -> InboundKind {
    match msg.message_type.as_str() {
        "text" => match &msg.text {
            Some(t) => InboundKind::Text {
                body: t.body.clone(),
            },
            None => InboundKind::Unsupported {
                type_name: "text-without-body".into(),
            },
        },
        "image" => media_kind(&msg.image, MediaType::Image),
        "audio" => media_kind(&msg.audio, MediaType::Audio),
        "video" => media_kind(&msg.video, MediaType::Video),
        "document" => media_kind(&msg.document, MediaType::Document),
        "interactive" => match &msg.interactive {
            Some(i) => {
                if let Some(reply) = &i.button_reply {
                    InboundKind::ButtonReply {
                        id: reply.id.clone(),
                        title: reply.title.clone(),
                    }
                } else if let Some(reply) = &i.list_reply {
                    InboundKind::ListReply {
                        id: reply.id.clone(),
                        title: reply.title.clone(),
                    }
                } else {
                    InboundKind::Unsupported {
                        type_name: format!("interactive:{}", i.interactive_type),
                    }
                }
            }
            None => InboundKind::Unsupported {
                type_name: "interactive".into(),
            },
        },
        "button" => match &msg.button {
            // Template quick-replies carry the payload as the option id.
            Some(b) => InboundKind::ButtonReply {
                id: b.payload.clone(),
                title: b.text.clone(),
            },
            None => InboundKind::Unsupported {
                type_name: "button".into(),
            },
        },
        other => InboundKind::Unsupported {
            type_name: other.to_string(),
        },
    }
}

fn media_kind(media: &Option<WaMedia>, media_type: MediaType) -> InboundKind {
    match media {
        Some(m) => InboundKind::Media {
            media: MediaRef {
                provider_media_id: m.id.clone(),
                mime_type: m.mime_type.clone(),
                sha256: m.sha256.clone(),
            },
            media_type,
            caption: m.caption.clone(),
        },
        None => InboundKind::Unsupported {
            type_name: media_type.as_str().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_envelope() -> WebhookEnvelope {
        serde_json::from_str(
            r#"{
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1234",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {
                      "display_phone_number": "+51 1 700 0000",
                      "phone_number_id": "104858275551234"
                    },
                    "contacts": [{"wa_id": "51999000001", "profile": {"name": "Ana"}}],
                    "messages": [{
                      "id": "wamid.abc",
                      "from": "51999000001",
                      "timestamp": "1700000000",
                      "type": "text",
                      "text": {"body": "hola"}
                    }]
                  }
                }]
              }]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn text_message_parses_to_event() {
        let events = parse_envelope(&text_envelope());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.key.channel_connection_id, "104858275551234");
        assert_eq!(ev.key.remote_phone, "51999000001");
        assert_eq!(ev.contact_name.as_deref(), Some("Ana"));
        assert_eq!(ev.provider_message_id.as_deref(), Some("wamid.abc"));
        assert_eq!(ev.provider_timestamp, Some(1_700_000_000));
        assert!(matches!(&ev.kind, InboundKind::Text { body } if body == "hola"));
    }

    #[test]
    fn button_reply_parses() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "104"},
                    "messages": [{
                      "id": "wamid.btn",
                      "from": "519",
                      "timestamp": "1700000001",
                      "type": "interactive",
                      "interactive": {
                        "type": "button_reply",
                        "button_reply": {"id": "opt:1", "title": "Ventas"}
                      }
                    }]
                  }
                }]
              }]
            }"#,
        )
        .unwrap();
        let events = parse_envelope(&envelope);
        assert!(matches!(
            &events[0].kind,
            InboundKind::ButtonReply { id, title } if id == "opt:1" && title == "Ventas"
        ));
    }

    #[test]
    fn status_update_parses() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "104"},
                    "statuses": [{
                      "id": "wamid.out1",
                      "status": "delivered",
                      "timestamp": "1700000002",
                      "recipient_id": "51999000001"
                    }]
                  }
                }]
              }]
            }"#,
        )
        .unwrap();
        let events = parse_envelope(&envelope);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].kind,
            InboundKind::StatusUpdate { status: DeliveryStatus::Delivered }
        ));
        assert_eq!(events[0].provider_message_id.as_deref(), Some("wamid.out1"));
    }

    #[test]
    fn unknown_type_becomes_unsupported() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "104"},
                    "messages": [{
                      "id": "wamid.loc",
                      "from": "519",
                      "timestamp": "1700000003",
                      "type": "location"
                    }]
                  }
                }]
              }]
            }"#,
        )
        .unwrap();
        let events = parse_envelope(&envelope);
        assert!(matches!(
            &events[0].kind,
            InboundKind::Unsupported { type_name } if type_name == "location"
        ));
    }

    #[test]
    fn missing_phone_number_id_skips_change() {
        let envelope: WebhookEnvelope = serde_json::from_str(
            r#"{
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {},
                    "messages": [{
                      "id": "wamid.x", "from": "519", "timestamp": "0", "type": "text",
                      "text": {"body": "hola"}
                    }]
                  }
                }]
              }]
            }"#,
        )
        .unwrap();
        assert!(parse_envelope(&envelope).is_empty());
    }
}
