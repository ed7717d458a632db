use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::context::AgentContext;

use super::{Tool, ToolResult};

pub struct SearchKnowledgeBase {
    ctx: Arc<AgentContext>,
}

impl SearchKnowledgeBase {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize)]
struct Input {
    query: String,
    #[serde(default)]
    category: Option<String>,
}

#[async_trait]
impl Tool for SearchKnowledgeBase {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Busca en la base de conocimiento de la empresa (productos, precios, políticas)."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Qué buscar" },
                "category": { "type": "string", "description": "Categoría opcional" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let input: Input = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid input: {e}")),
        };
        let Some(knowledge) = &self.ctx.knowledge else {
            return ToolResult::error("knowledge base is not configured");
        };

        match knowledge.search(&input.query, input.category.as_deref()).await {
            Ok(answer) => {
                if let Err(e) = self.ctx.store.record_rag_usage(
                    Some(&self.ctx.conversation_id),
                    &input.query,
                    answer.found,
                    answer.chunks_used,
                    answer.cost,
                ) {
                    warn!(error = %e, "failed to record rag usage");
                }
                ToolResult::json(&json!({
                    "found": answer.found,
                    "answer": answer.answer,
                    "chunks_used": answer.chunks_used,
                    "cost": answer.cost,
                }))
            }
            Err(e) => ToolResult::error(format!("knowledge search failed: {e}")),
        }
    }
}
