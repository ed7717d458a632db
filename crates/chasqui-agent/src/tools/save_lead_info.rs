use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::context::AgentContext;

use super::{Tool, ToolResult};

/// Best-effort CRM write: a failed save is logged and reported to the
/// model, but never fails the turn.
pub struct SaveLeadInfo {
    ctx: Arc<AgentContext>,
}

impl SaveLeadInfo {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    business_type: Option<String>,
    #[serde(default)]
    interest: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[async_trait]
impl Tool for SaveLeadInfo {
    fn name(&self) -> &str {
        "save_lead_info"
    }

    fn description(&self) -> &str {
        "Guarda los datos de un prospecto en el CRM."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "phone": { "type": "string" },
                "name": { "type": "string" },
                "location": { "type": "string" },
                "business_type": { "type": "string" },
                "interest": { "type": "string" },
                "notes": { "type": "string" }
            },
            "required": ["phone"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };
        let Some(crm) = &self.ctx.crm else {
            return ToolResult::json(&json!({ "saved": false, "reason": "crm not configured" }));
        };

        let mut fields = serde_json::Map::new();
        fields.insert("PHONE".into(), json!(input.phone));
        for (key, value) in [
            ("NAME", input.name),
            ("LOCATION", input.location),
            ("BUSINESS_TYPE", input.business_type),
            ("INTEREST", input.interest),
            ("COMMENTS", input.notes),
        ] {
            if let Some(value) = value {
                fields.insert(key.into(), json!(value));
            }
        }

        match crm.add_lead(&fields).await {
            Ok(lead_id) => ToolResult::json(&json!({ "saved": true, "lead_id": lead_id })),
            Err(e) => {
                warn!(error = %e, "lead save failed");
                ToolResult::json(&json!({ "saved": false, "reason": e.to_string() }))
            }
        }
    }
}
