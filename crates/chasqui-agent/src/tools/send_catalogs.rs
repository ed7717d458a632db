use std::sync::Arc;

use async_trait::async_trait;
use chasqui_wire::event::MediaType;
use chasqui_wire::outbound::{OutboundMedia, OutboundMessage};
use serde::Deserialize;
use serde_json::json;

use crate::context::AgentContext;

use super::{Tool, ToolResult};

pub struct SendCatalogs {
    ctx: Arc<AgentContext>,
}

impl SendCatalogs {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    with_prices: bool,
    brands: Vec<String>,
    #[serde(default)]
    customer_note: Option<String>,
}

#[async_trait]
impl Tool for SendCatalogs {
    fn name(&self) -> &str {
        "send_catalogs"
    }

    fn description(&self) -> &str {
        "Envía catálogos en PDF al cliente, por marca, con o sin precios."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "with_prices": { "type": "boolean" },
                "brands": { "type": "array", "items": { "type": "string" } },
                "customer_note": { "type": "string" }
            },
            "required": ["with_prices", "brands"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };
        if input.brands.is_empty() {
            return ToolResult::error("brands must not be empty");
        }

        if let Some(note) = &input.customer_note {
            let msg = OutboundMessage::Text { body: note.clone() };
            if let Err(e) = self.ctx.sink.send(&self.ctx.conversation_id, &msg).await {
                return ToolResult::error(format!("failed to send note: {e}"));
            }
        }

        let variant = if input.with_prices { "con-precios" } else { "sin-precios" };
        let mut sent = Vec::new();
        for brand in &input.brands {
            let slug: String = brand
                .to_lowercase()
                .chars()
                .map(|c| if c.is_alphanumeric() { c } else { '-' })
                .collect();
            let url = format!("{}/{slug}-{variant}.pdf", self.ctx.catalog_base_url);
            let msg = OutboundMessage::Media {
                media: OutboundMedia::from_source(&url),
                media_type: MediaType::Document,
                caption: Some(format!("Catálogo {brand}")),
            };
            if let Err(e) = self.ctx.sink.send(&self.ctx.conversation_id, &msg).await {
                return ToolResult::error(format!("failed to send catalog {brand}: {e}"));
            }
            sent.push(brand.clone());
        }

        ToolResult::json(&json!({ "sent": sent, "with_prices": input.with_prices }))
    }
}
