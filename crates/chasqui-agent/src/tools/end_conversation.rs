use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::context::{AgentContext, TurnOutcome};

use super::{Tool, ToolResult};

pub struct EndConversation {
    ctx: Arc<AgentContext>,
}

impl EndConversation {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    reason: String,
    #[serde(default)]
    customer_satisfied: Option<bool>,
}

#[async_trait]
impl Tool for EndConversation {
    fn name(&self) -> &str {
        "end_conversation"
    }

    fn description(&self) -> &str {
        "Termina la conversación cuando el cliente ya fue atendido."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string" },
                "customer_satisfied": { "type": "boolean" }
            },
            "required": ["reason"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };
        info!(
            conversation_id = %self.ctx.conversation_id,
            reason = %input.reason,
            satisfied = ?input.customer_satisfied,
            "agent ended conversation"
        );
        self.ctx.set_outcome(TurnOutcome::Ended {
            close_conversation: input.customer_satisfied.unwrap_or(false),
        });
        ToolResult::json(&json!({ "ended": true }))
    }
}
