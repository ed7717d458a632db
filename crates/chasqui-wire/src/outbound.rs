//! Outbound payload builders for the Cloud API `/messages` endpoint.
//!
//! Channel limits enforced here: interactive button messages carry at most
//! three buttons with titles of at most 20 characters; anything larger is
//! folded into a single interactive list message (row titles capped at 24).

use serde_json::{json, Value};

/// Interactive button titles: hard provider limit.
pub const BUTTON_TITLE_MAX: usize = 20;
/// Interactive list row titles.
pub const LIST_TITLE_MAX: usize = 24;
/// Buttons per interactive message before folding into a list.
pub const BUTTONS_MAX: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonOption {
    pub id: String,
    pub label: String,
}

/// A provider-agnostic outbound message, materialized by the flow engine
/// or an operator send and encoded here.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Media {
        media: OutboundMedia,
        media_type: crate::event::MediaType,
        caption: Option<String>,
    },
    Buttons {
        body: String,
        options: Vec<ButtonOption>,
    },
    List {
        body: String,
        button_label: String,
        options: Vec<ButtonOption>,
    },
    /// Re-engagement template for sends outside the 24-hour window.
    Template {
        name: String,
        language: String,
        body_params: Vec<String>,
    },
}

/// Where outbound media lives: a public HTTPS link or a pre-uploaded
/// provider media id.
#[derive(Debug, Clone)]
pub enum OutboundMedia {
    Link(String),
    ProviderId(String),
}

impl OutboundMedia {
    /// Choose `Link` only for public HTTPS URLs; anything else must be
    /// uploaded first and referenced by id.
    pub fn from_source(source: &str) -> Self {
        if source.starts_with("https://") {
            OutboundMedia::Link(source.to_string())
        } else {
            OutboundMedia::ProviderId(source.to_string())
        }
    }
}

/// Build an interactive message from caller options: buttons when they fit,
/// a single list message when they don't.
pub fn buttons_or_list(body: impl Into<String>, options: Vec<ButtonOption>) -> OutboundMessage {
    let body = body.into();
    if options.len() <= BUTTONS_MAX {
        OutboundMessage::Buttons { body, options }
    } else {
        OutboundMessage::List {
            body,
            button_label: "Ver opciones".to_string(),
            options,
        }
    }
}

/// Encode a message into the Cloud API request body.
pub fn build_payload(to: &str, msg: &OutboundMessage) -> Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });

    let obj = payload.as_object_mut().expect("payload is an object");
    match msg {
        OutboundMessage::Text { body } => {
            obj.insert("type".into(), json!("text"));
            obj.insert(
                "text".into(),
                json!({ "body": body, "preview_url": false }),
            );
        }
        OutboundMessage::Media {
            media,
            media_type,
            caption,
        } => {
            let type_name = media_type.as_str();
            obj.insert("type".into(), json!(type_name));
            let mut media_obj = match media {
                OutboundMedia::Link(url) => json!({ "link": url }),
                OutboundMedia::ProviderId(id) => json!({ "id": id }),
            };
            // Audio does not support captions.
            if let Some(caption) = caption {
                if *media_type != crate::event::MediaType::Audio {
                    media_obj
                        .as_object_mut()
                        .expect("media is an object")
                        .insert("caption".into(), json!(caption));
                }
            }
            obj.insert(type_name.into(), media_obj);
        }
        OutboundMessage::Buttons { body, options } => {
            let buttons: Vec<Value> = options
                .iter()
                .take(BUTTONS_MAX)
                .map(|o| {
                    json!({
                        "type": "reply",
                        "reply": { "id": o.id, "title": truncate(&o.label, BUTTON_TITLE_MAX) }
                    })
                })
                .collect();
            obj.insert("type".into(), json!("interactive"));
            obj.insert(
                "interactive".into(),
                json!({
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": buttons }
                }),
            );
        }
        OutboundMessage::List {
            body,
            button_label,
            options,
        } => {
            let rows: Vec<Value> = options
                .iter()
                .map(|o| json!({ "id": o.id, "title": truncate(&o.label, LIST_TITLE_MAX) }))
                .collect();
            obj.insert("type".into(), json!("interactive"));
            obj.insert(
                "interactive".into(),
                json!({
                    "type": "list",
                    "body": { "text": body },
                    "action": {
                        "button": truncate(button_label, BUTTON_TITLE_MAX),
                        "sections": [{ "title": "Opciones", "rows": rows }]
                    }
                }),
            );
        }
        OutboundMessage::Template {
            name,
            language,
            body_params,
        } => {
            let params: Vec<Value> = body_params
                .iter()
                .map(|p| json!({ "type": "text", "text": p }))
                .collect();
            let mut template = json!({
                "name": name,
                "language": { "code": language },
            });
            if !params.is_empty() {
                template
                    .as_object_mut()
                    .expect("template is an object")
                    .insert(
                        "components".into(),
                        json!([{ "type": "body", "parameters": params }]),
                    );
            }
            obj.insert("type".into(), json!("template"));
            obj.insert("template".into(), template);
        }
    }

    payload
}

/// Char-boundary-safe truncation.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Preview text stored on the conversation for the operator list.
pub fn preview_text(msg: &OutboundMessage) -> String {
    match msg {
        OutboundMessage::Text { body } => body.clone(),
        OutboundMessage::Media { media_type, caption, .. } => caption
            .clone()
            .unwrap_or_else(|| format!("[{}]", media_type.as_str())),
        OutboundMessage::Buttons { body, .. } | OutboundMessage::List { body, .. } => body.clone(),
        OutboundMessage::Template { name, .. } => format!("[plantilla {name}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MediaType;

    fn options(n: usize) -> Vec<ButtonOption> {
        (1..=n)
            .map(|i| ButtonOption {
                id: format!("opt:{i}"),
                label: format!("Opción {i}"),
            })
            .collect()
    }

    #[test]
    fn text_disables_preview() {
        let payload = build_payload("51999000001", &OutboundMessage::Text { body: "Hola".into() });
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["text"]["body"], "Hola");
        assert_eq!(payload["text"]["preview_url"], false);
        assert_eq!(payload["to"], "51999000001");
    }

    #[test]
    fn three_options_stay_buttons() {
        let msg = buttons_or_list("Elige", options(3));
        assert!(matches!(msg, OutboundMessage::Buttons { .. }));
        let payload = build_payload("519", &msg);
        assert_eq!(payload["interactive"]["type"], "button");
        assert_eq!(
            payload["interactive"]["action"]["buttons"]
                .as_array()
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn four_options_fold_into_list() {
        let msg = buttons_or_list("Elige", options(4));
        assert!(matches!(msg, OutboundMessage::List { .. }));
        let payload = build_payload("519", &msg);
        assert_eq!(payload["interactive"]["type"], "list");
        let rows = payload["interactive"]["action"]["sections"][0]["rows"]
            .as_array()
            .unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn long_button_titles_are_truncated() {
        let msg = OutboundMessage::Buttons {
            body: "Elige".into(),
            options: vec![ButtonOption {
                id: "opt:1".into(),
                label: "Atención al cliente corporativo".into(),
            }],
        };
        let payload = build_payload("519", &msg);
        let title = payload["interactive"]["action"]["buttons"][0]["reply"]["title"]
            .as_str()
            .unwrap();
        assert_eq!(title.chars().count(), BUTTON_TITLE_MAX);
    }

    #[test]
    fn https_source_becomes_link() {
        assert!(matches!(
            OutboundMedia::from_source("https://cdn.example.com/c.pdf"),
            OutboundMedia::Link(_)
        ));
        assert!(matches!(
            OutboundMedia::from_source("3851234567890"),
            OutboundMedia::ProviderId(_)
        ));
        assert!(matches!(
            OutboundMedia::from_source("http://insecure.example.com/c.pdf"),
            OutboundMedia::ProviderId(_)
        ));
    }

    #[test]
    fn media_caption_applied_except_audio() {
        let doc = OutboundMessage::Media {
            media: OutboundMedia::Link("https://x/c.pdf".into()),
            media_type: MediaType::Document,
            caption: Some("Catálogo".into()),
        };
        let payload = build_payload("519", &doc);
        assert_eq!(payload["document"]["caption"], "Catálogo");
        assert_eq!(payload["document"]["link"], "https://x/c.pdf");

        let audio = OutboundMessage::Media {
            media: OutboundMedia::ProviderId("123".into()),
            media_type: MediaType::Audio,
            caption: Some("ignored".into()),
        };
        let payload = build_payload("519", &audio);
        assert!(payload["audio"].get("caption").is_none());
        assert_eq!(payload["audio"]["id"], "123");
    }

    #[test]
    fn template_carries_body_params() {
        let msg = OutboundMessage::Template {
            name: "reengage_24h".into(),
            language: "es".into(),
            body_params: vec!["Ana".into()],
        };
        let payload = build_payload("519", &msg);
        assert_eq!(payload["template"]["name"], "reengage_24h");
        assert_eq!(payload["template"]["language"]["code"], "es");
        assert_eq!(
            payload["template"]["components"][0]["parameters"][0]["text"],
            "Ana"
        );
    }
}
