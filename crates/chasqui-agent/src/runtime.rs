//! The tool execution loop.
//!
//! prompt → LLM → if tool_use → execute tools → inject results → LLM →
//! repeat. Stops when the model answers without tools, when a tool
//! terminates the turn (transfer/end), or when the per-turn budget runs
//! out, budget exhaustion force-transfers the chat to support so the
//! customer is never left hanging.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::{AgentContext, TurnOutcome};
use crate::provider::{ChatProvider, ChatRequest, ChatResponse, ProviderError, ToolCall};
use crate::tools::{build_tools, to_definitions, Tool, ToolResult};

/// Hard budget of tool calls per user turn.
pub const MAX_TOOL_CALLS_PER_TURN: usize = 8;

#[derive(Debug)]
pub struct TurnResult {
    /// Final assistant text to deliver to the user, when the turn ended
    /// with a plain answer.
    pub reply: Option<String>,
    pub outcome: TurnOutcome,
    pub tool_calls_used: usize,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

pub struct AgentRuntime {
    provider: Arc<dyn ChatProvider>,
    default_model: String,
    max_tokens: u32,
}

impl AgentRuntime {
    pub fn new(provider: Arc<dyn ChatProvider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            max_tokens: 1024,
        }
    }

    /// Run one user turn. `history` is the prior raw message list; the
    /// caller persists whatever context policy it wants between turns.
    pub async fn run_turn(
        &self,
        ctx: Arc<AgentContext>,
        system_prompt: &str,
        model_override: Option<&str>,
        history: Vec<Value>,
        user_text: &str,
    ) -> Result<TurnResult, ProviderError> {
        let tools = build_tools(ctx.clone());
        let definitions = to_definitions(&tools);
        let model = model_override.unwrap_or(&self.default_model);

        let mut messages = history;
        messages.push(json!({ "role": "user", "content": user_text }));

        let mut calls_used = 0usize;
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;

        loop {
            let mut req = ChatRequest::new(model, system_prompt);
            req.messages = messages.clone();
            req.max_tokens = self.max_tokens;
            req.tools = definitions.clone();

            let response = self.provider.send(&req).await?;
            tokens_in += response.tokens_in;
            tokens_out += response.tokens_out;

            if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
                debug!(calls_used, "agent turn complete");
                return Ok(TurnResult {
                    reply: non_empty(response.content),
                    outcome: ctx.outcome(),
                    tool_calls_used: calls_used,
                    tokens_in,
                    tokens_out,
                });
            }

            push_assistant_turn(&mut messages, &response);

            let mut results: Vec<Value> = Vec::new();
            for call in &response.tool_calls {
                if calls_used >= MAX_TOOL_CALLS_PER_TURN {
                    warn!(
                        conversation_id = %ctx.conversation_id,
                        "tool budget exhausted, forcing transfer to support"
                    );
                    self.force_transfer(&ctx);
                    return Ok(TurnResult {
                        reply: None,
                        outcome: ctx.outcome(),
                        tool_calls_used: calls_used,
                        tokens_in,
                        tokens_out,
                    });
                }
                calls_used += 1;

                let result = execute_tool(&tools, call).await;
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": result.content,
                    "is_error": result.is_error,
                }));

                // A terminating tool (transfer/end) wins immediately; the
                // remaining calls in this batch are moot.
                if ctx.outcome() != TurnOutcome::Continue {
                    info!(conversation_id = %ctx.conversation_id, "turn terminated by tool");
                    return Ok(TurnResult {
                        reply: None,
                        outcome: ctx.outcome(),
                        tool_calls_used: calls_used,
                        tokens_in,
                        tokens_out,
                    });
                }
            }

            messages.push(json!({ "role": "user", "content": results }));
        }
    }

    fn force_transfer(&self, ctx: &AgentContext) {
        let queue_id = match ctx.resolve_queue_id("support") {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "no support queue for forced transfer");
                return;
            }
        };
        match ctx.queue.transfer_to_queue_locked(
            &ctx.conversation_id,
            &queue_id,
            Some("límite de herramientas del asistente"),
            None,
        ) {
            Ok(()) => ctx.set_outcome(TurnOutcome::Transferred { queue_id }),
            Err(e) => warn!(error = %e, "forced transfer failed"),
        }
    }
}

fn push_assistant_turn(messages: &mut Vec<Value>, response: &ChatResponse) {
    let mut content: Vec<Value> = Vec::new();
    if !response.content.is_empty() {
        content.push(json!({ "type": "text", "text": response.content }));
    }
    for call in &response.tool_calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }));
    }
    messages.push(json!({ "role": "assistant", "content": content }));
}

async fn execute_tool(tools: &[Box<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => {
            debug!(tool = %call.name, "executing tool");
            tool.execute(call.input.clone()).await
        }
        None => ToolResult::error(format!("unknown tool: {}", call.name)),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{KnowledgeAnswer, KnowledgeIndex};
    use crate::context::MessageSink;
    use async_trait::async_trait;
    use chasqui_core::types::ConversationKey;
    use chasqui_queue::{Dispatcher, QueueEngine};
    use chasqui_store::queues::DistributionMode;
    use chasqui_store::Store;
    use chasqui_wire::outbound::OutboundMessage;
    use std::sync::Mutex;

    struct StubProvider {
        responses: Mutex<Vec<ChatResponse>>,
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                // endless tool requests, exercises the budget
                return Ok(tool_response("search_knowledge_base", json!({"query": "x"})));
            }
            Ok(responses.remove(0))
        }
    }

    struct StubSink {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MessageSink for StubSink {
        async fn send(
            &self,
            _conversation_id: &str,
            msg: &OutboundMessage,
        ) -> chasqui_core::Result<()> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    struct StubKnowledge;

    #[async_trait]
    impl KnowledgeIndex for StubKnowledge {
        async fn search(
            &self,
            _query: &str,
            _category: Option<&str>,
        ) -> chasqui_core::Result<KnowledgeAnswer> {
            Ok(KnowledgeAnswer {
                found: true,
                answer: "respuesta".into(),
                chunks_used: 2,
                cost: 0.001,
            })
        }
    }

    fn tool_response(name: &str, input: Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            stop_reason: "tool_use".into(),
            tool_calls: vec![ToolCall {
                id: format!("tu_{name}"),
                name: name.into(),
                input,
            }],
            tokens_in: 10,
            tokens_out: 5,
        }
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.into(),
            stop_reason: "end_turn".into(),
            tool_calls: Vec::new(),
            tokens_in: 10,
            tokens_out: 5,
        }
    }

    fn fixture(responses: Vec<ChatResponse>) -> (Arc<Store>, Arc<AgentContext>, AgentRuntime) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_queue("Soporte", DistributionMode::Manual, 5)
            .unwrap();
        let conv = store
            .upsert_on_inbound(&ConversationKey::new("104", "519"), None, None)
            .unwrap();

        let (_dispatcher, handle) = Dispatcher::new(store.clone());
        let queue = Arc::new(QueueEngine::new(store.clone(), handle));
        let ctx = Arc::new(AgentContext::new(
            store.clone(),
            queue,
            Arc::new(StubSink { sent: Mutex::new(Vec::new()) }),
            conv.id,
            ConversationKey::new("104", "519"),
            None,
            None,
            Some(Arc::new(StubKnowledge)),
            "https://cdn.example.com/catalogos",
            -300,
        ));
        let runtime = AgentRuntime::new(
            Arc::new(StubProvider { responses: Mutex::new(responses) }),
            "claude-sonnet-4-5",
        );
        (store, ctx, runtime)
    }

    #[tokio::test]
    async fn plain_answer_ends_turn() {
        let (_store, ctx, runtime) = fixture(vec![text_response("Hola, ¿en qué ayudo?")]);
        let result = runtime
            .run_turn(ctx, "asistente", None, Vec::new(), "hola")
            .await
            .unwrap();
        assert_eq!(result.reply.as_deref(), Some("Hola, ¿en qué ayudo?"));
        assert_eq!(result.outcome, TurnOutcome::Continue);
        assert_eq!(result.tool_calls_used, 0);
    }

    #[tokio::test]
    async fn tool_then_answer() {
        let (_store, ctx, runtime) = fixture(vec![
            tool_response("search_knowledge_base", json!({"query": "precios"})),
            text_response("El precio es S/ 100."),
        ]);
        let result = runtime
            .run_turn(ctx, "asistente", None, Vec::new(), "¿precio?")
            .await
            .unwrap();
        assert_eq!(result.reply.as_deref(), Some("El precio es S/ 100."));
        assert_eq!(result.tool_calls_used, 1);
    }

    #[tokio::test]
    async fn end_tool_terminates_turn() {
        let (_store, ctx, runtime) = fixture(vec![tool_response(
            "end_conversation",
            json!({"reason": "resuelto", "customer_satisfied": true}),
        )]);
        let result = runtime
            .run_turn(ctx, "asistente", None, Vec::new(), "gracias")
            .await
            .unwrap();
        assert_eq!(result.outcome, TurnOutcome::Ended { close_conversation: true });
        assert!(result.reply.is_none());
    }

    #[tokio::test]
    async fn budget_exhaustion_forces_support_transfer() {
        // Empty script → the stub provider asks for a tool forever.
        let (store, ctx, runtime) = fixture(Vec::new());
        let conversation_id = ctx.conversation_id.clone();
        let result = runtime
            .run_turn(ctx, "asistente", None, Vec::new(), "hola")
            .await
            .unwrap();

        assert_eq!(result.tool_calls_used, MAX_TOOL_CALLS_PER_TURN);
        assert!(matches!(result.outcome, TurnOutcome::Transferred { .. }));

        let conv = store.get_conversation(&conversation_id).unwrap();
        let support = store.find_queue_by_name("Soporte").unwrap().unwrap();
        assert_eq!(conv.queue_id.as_deref(), Some(support.id.as_str()));
        assert!(conv.assigned_to.is_none());
    }
}
