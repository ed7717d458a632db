use std::sync::Arc;

use async_trait::async_trait;
use chasqui_core::hours;
use serde::Deserialize;
use serde_json::json;

use crate::context::AgentContext;

use super::{Tool, ToolResult};

pub struct CheckBusinessHours {
    ctx: Arc<AgentContext>,
}

impl CheckBusinessHours {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    queue_type: String,
}

#[async_trait]
impl Tool for CheckBusinessHours {
    fn name(&self) -> &str {
        "check_business_hours"
    }

    fn description(&self) -> &str {
        "Consulta si el equipo indicado está dentro de su horario de atención."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "queue_type": { "type": "string", "enum": ["sales", "support", "prospects"] }
            },
            "required": ["queue_type"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };

        // Queue schedule first, CRM-maintained schedule as fallback.
        let schedule = match self.ctx.resolve_queue_id(&input.queue_type) {
            Ok(queue_id) => self
                .ctx
                .store
                .get_queue(&queue_id)
                .ok()
                .and_then(|q| q.schedule),
            Err(_) => None,
        };
        let schedule = match schedule {
            Some(s) => Some(s),
            None => match &self.ctx.crm {
                Some(crm) => crm
                    .fetch_schedule(&input.queue_type)
                    .await
                    .ok()
                    .flatten(),
                None => None,
            },
        };

        let Some(schedule) = schedule else {
            return ToolResult::error(format!(
                "no schedule configured for {}",
                input.queue_type
            ));
        };

        let status = hours::evaluate(
            &schedule,
            chrono::Utc::now(),
            self.ctx.locale_offset_minutes,
        );
        ToolResult::json(&json!({
            "is_open": status.is_open,
            "current_day": status.current_day,
            "current_time": status.current_time,
            "schedule": status.schedule,
        }))
    }
}
