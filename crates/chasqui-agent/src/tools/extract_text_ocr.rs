use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::context::AgentContext;

use super::{Tool, ToolResult};

pub struct ExtractTextOcr {
    ctx: Arc<AgentContext>,
}

impl ExtractTextOcr {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    image_url: String,
    document_type: String,
    #[serde(default)]
    purpose: Option<String>,
}

#[async_trait]
impl Tool for ExtractTextOcr {
    fn name(&self) -> &str {
        "extract_text_ocr"
    }

    fn description(&self) -> &str {
        "Extrae el texto de una imagen enviada por el cliente (voucher, DNI, factura)."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "image_url": { "type": "string" },
                "document_type": { "type": "string" },
                "purpose": { "type": "string" }
            },
            "required": ["image_url", "document_type"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };
        let Some(ocr) = &self.ctx.ocr else {
            return ToolResult::error("OCR is not configured");
        };

        match ocr
            .extract(&input.image_url, &input.document_type, input.purpose.as_deref())
            .await
        {
            Ok(result) => ToolResult::json(&json!({
                "text": result.text,
                "context": result.context,
            })),
            Err(e) => ToolResult::error(format!("OCR failed: {e}")),
        }
    }
}
