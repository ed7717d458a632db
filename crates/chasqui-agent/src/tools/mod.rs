//! Tool system for the agent node.
//!
//! Defines the `Tool` trait all tools implement, plus the fixed catalogue
//! builder and conversion to provider tool definitions.

pub mod check_business_hours;
pub mod end_conversation;
pub mod extract_text_ocr;
pub mod save_lead_info;
pub mod search_knowledge_base;
pub mod send_catalogs;
pub mod transfer_to_queue;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::AgentContext;
use crate::provider::ToolDefinition;

/// Result of executing a tool. The content goes back into the LLM
/// context only, the end user never sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            content: value.to_string(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value) -> ToolResult;
}

/// The fixed tool catalogue, exactly these seven names.
pub fn build_tools(ctx: Arc<AgentContext>) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(search_knowledge_base::SearchKnowledgeBase::new(ctx.clone())),
        Box::new(send_catalogs::SendCatalogs::new(ctx.clone())),
        Box::new(transfer_to_queue::TransferToQueue::new(ctx.clone())),
        Box::new(check_business_hours::CheckBusinessHours::new(ctx.clone())),
        Box::new(save_lead_info::SaveLeadInfo::new(ctx.clone())),
        Box::new(extract_text_ocr::ExtractTextOcr::new(ctx.clone())),
        Box::new(end_conversation::EndConversation::new(ctx)),
    ]
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Box<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
        })
        .collect()
}
