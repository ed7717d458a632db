use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::context::{AgentContext, TurnOutcome};

use super::{Tool, ToolResult};

pub struct TransferToQueue {
    ctx: Arc<AgentContext>,
}

impl TransferToQueue {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    queue_type: String,
    reason: String,
    #[serde(default)]
    customer_info: Option<serde_json::Map<String, serde_json::Value>>,
}

#[async_trait]
impl Tool for TransferToQueue {
    fn name(&self) -> &str {
        "transfer_to_queue"
    }

    fn description(&self) -> &str {
        "Transfiere la conversación a un asesor humano (sales, support o prospects)."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "queue_type": { "type": "string", "enum": ["sales", "support", "prospects"] },
                "reason": { "type": "string" },
                "customer_info": { "type": "object" }
            },
            "required": ["queue_type", "reason"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };

        let queue_id = match self.ctx.resolve_queue_id(&input.queue_type) {
            Ok(id) => id,
            Err(e) => return ToolResult::error(format!("cannot resolve queue: {e}")),
        };

        // Customer info rides along to the CRM, best-effort.
        if let (Some(crm), Some(info)) = (&self.ctx.crm, &input.customer_info) {
            if let Err(e) = crm.add_lead(info).await {
                warn!(error = %e, "customer_info save failed during transfer");
            }
        }

        // The agent runs inside the engine's macro-step, which already
        // holds the conversation lock.
        match self.ctx.queue.transfer_to_queue_locked(
            &self.ctx.conversation_id,
            &queue_id,
            Some(&input.reason),
            None,
        ) {
            Ok(()) => {
                self.ctx.set_outcome(TurnOutcome::Transferred {
                    queue_id: queue_id.clone(),
                });
                ToolResult::json(&json!({ "transferred": true, "queue_id": queue_id }))
            }
            Err(e) => ToolResult::error(format!("transfer failed: {e}")),
        }
    }
}
