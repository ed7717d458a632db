//! The macro-step executor.

use std::sync::Arc;
use std::time::Duration;

use chasqui_agent::adapters::{KnowledgeIndex, OcrAdapter};
use chasqui_agent::{AgentContext, AgentRuntime, MessageSink, TurnOutcome};
use chasqui_core::types::{now_millis, ConversationKey, ASSIGNED_BOT};
use chasqui_flows::graph::{handle, FlowDefinition, FlowNode};
use chasqui_flows::node::{
    MenuMode, NodeKind, QuestionInput, ScheduleSource,
};
use chasqui_flows::FlowCatalog;
use chasqui_queue::{QueueEngine, QueueTrigger};
use chasqui_sessions::{Awaiting, BotSession, SessionStore};
use chasqui_store::connections::ChannelConnection;
use chasqui_store::types::{Conversation, Direction, MessageType, NewMessage};
use chasqui_store::Store;
use chasqui_wire::crm::CrmAdapter;
use chasqui_wire::event::{InboundEvent, InboundKind, MediaType};
use chasqui_wire::outbound::{buttons_or_list, ButtonOption, OutboundMedia, OutboundMessage};
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::condition;
use crate::error::{EngineError, Result};
use crate::sender::OutboundSender;
use crate::substitute::substitute;
use crate::validate;

/// Session variable holding the most recent user text.
const LAST_INPUT_VAR: &str = "_last_user_message";
/// Session variable holding the agent node's raw message history.
const AGENT_HISTORY_VAR: &str = "_agent_history";
const AGENT_HISTORY_MAX: usize = 20;
/// Cycle guard: nodes traversed in one macro-step.
const MAX_NODES_PER_STEP: usize = 32;
const DEFAULT_RETRY_MESSAGE: &str = "Opción no válida, por favor intenta nuevamente.";
const WEBHOOK_BACKOFF_MS: [u64; 3] = [500, 1500, 4500];

/// How a macro-step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEnd {
    /// Waiting for user input at a question/buttons/menu/agent node.
    Waiting,
    /// Parked at a webhook_in node until a correlated POST arrives.
    Parked,
    /// Suspended at a delay node; a timer resumes it.
    Suspended,
    /// The flow handed the conversation off to a queue.
    Transferred,
    /// The flow ended; the session is gone.
    Ended,
    /// Nothing to do (status update, duplicate, advisor-owned message).
    NoStep,
}

enum Advance {
    Goto(String),
    Wait(Awaiting),
    Suspend { wake_at_ms: i64 },
    Park,
    Transferred,
    Ended,
}

enum InputOutcome {
    Follow(String),
    Retry,
    /// Re-execute the current node with the fresh input (agent nodes).
    ReExecute,
}

/// External hooks for `agent` nodes.
pub struct AgentWiring {
    pub runtime: Arc<AgentRuntime>,
    pub ocr: Option<Arc<dyn OcrAdapter>>,
    pub knowledge: Option<Arc<dyn KnowledgeIndex>>,
    pub catalog_base_url: String,
}

pub struct FlowRuntime {
    store: Arc<Store>,
    sessions: Arc<SessionStore>,
    catalog: Arc<FlowCatalog>,
    sender: Arc<dyn OutboundSender>,
    queue: Arc<QueueEngine>,
    crm: Option<Arc<dyn CrmAdapter>>,
    agent: Option<AgentWiring>,
    http: reqwest::Client,
    locale_offset_minutes: i32,
}

/// Per-step scratch: the CRM contact fields, fetched lazily at most once.
struct StepCtx {
    crm_fields: Option<Map<String, Value>>,
    crm_fetched: bool,
}

impl StepCtx {
    fn new() -> Self {
        Self {
            crm_fields: None,
            crm_fetched: false,
        }
    }
}

impl FlowRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionStore>,
        catalog: Arc<FlowCatalog>,
        sender: Arc<dyn OutboundSender>,
        queue: Arc<QueueEngine>,
        crm: Option<Arc<dyn CrmAdapter>>,
        agent: Option<AgentWiring>,
        locale_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            sessions,
            catalog,
            sender,
            queue,
            crm,
            agent,
            http: reqwest::Client::new(),
            locale_offset_minutes,
        }
    }

    // ── Entry points ────────────────────────────────────────────────────

    /// Process one inbound event end-to-end: upsert, dedup, append, and -
    /// when the bot owns the conversation, run a macro-step.
    #[instrument(skip(self, connection, event), fields(key = %event.key))]
    pub async fn handle_inbound(
        self: &Arc<Self>,
        connection: &ChannelConnection,
        event: &InboundEvent,
    ) -> Result<StepEnd> {
        // Delivery-status updates touch a message, never a session.
        if let InboundKind::StatusUpdate { status } = &event.kind {
            if let Some(pid) = &event.provider_message_id {
                let status = chasqui_store::types::MessageStatus::parse(status.as_str())
                    .unwrap_or(chasqui_store::types::MessageStatus::Sent);
                self.store.mark_status_by_provider_id(pid, status)?;
            }
            return Ok(StepEnd::NoStep);
        }

        // The canonical key uses the connection's provider id, not
        // whatever alias the webhook was routed by.
        let key = ConversationKey::new(
            connection.provider_phone_number_id.clone(),
            event.key.remote_phone.clone(),
        );

        if let Some(pid) = &event.provider_message_id {
            if self.store.message_exists(pid)? {
                debug!(provider_message_id = %pid, "duplicate inbound, ignoring");
                return Ok(StepEnd::NoStep);
            }
        }

        let conversation = self.store.upsert_on_inbound(
            &key,
            event.display_number.as_deref(),
            event.contact_name.as_deref(),
        )?;

        let _guard = self.store.lock_conversation(&conversation.id).await;

        // Re-check under the lock: a concurrent webhook delivery of the
        // same message may have won the race.
        if let Some(pid) = &event.provider_message_id {
            if self.store.message_exists(pid)? {
                return Ok(StepEnd::NoStep);
            }
        }

        self.append_inbound(&conversation, event)?;
        let conversation = self.store.get_conversation(&conversation.id)?;

        let session = self.sessions.get(&key)?;
        if session.is_some() || conversation.is_bot_owned() {
            return self.run_bot_turn(&conversation, session, Some(event)).await;
        }

        // Unowned, unqueued and active: a brand-new conversation, or one
        // whose previous flow ended without closing, either way the entry
        // flow takes it.
        if conversation.status == chasqui_store::types::ConversationStatus::Active
            && conversation.assigned_to.is_none()
            && conversation.queued_at.is_none()
        {
            return self.start_entry_flow(connection, &conversation, event).await;
        }

        // Advisor-owned or already queued: the append above notified the
        // realtime bus; nothing else to do.
        Ok(StepEnd::NoStep)
    }

    /// Resume a session whose delay timer fired (in-memory or durable).
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resume_wakeup(self: &Arc<Self>, key: &ConversationKey) -> Result<StepEnd> {
        let Some(conversation) = self.store.find_active_by_key(key)? else {
            // conversation vanished; drop the orphan session
            self.sessions.delete_if_exists(key)?;
            return Ok(StepEnd::NoStep);
        };

        let _guard = self.store.lock_conversation(&conversation.id).await;
        let Some(mut session) = self.sessions.get(key)? else {
            return Ok(StepEnd::NoStep);
        };
        match session.wake_at {
            Some(wake_at) if wake_at <= now_millis() => {}
            // spurious or early wake, the durable pass will catch it
            _ => return Ok(StepEnd::NoStep),
        }
        session.wake_at = None;

        let flow = self.catalog.get(&session.flow_id)?;
        let mut ctx = StepCtx::new();
        self.continue_from(
            &flow,
            &conversation,
            &mut session,
            Some(handle::DEFAULT.to_string()),
            &mut ctx,
        )
        .await
    }

    /// Deliver a correlated inbound webhook to a parked session. Returns
    /// false when the conversation is not parked at a webhook_in node.
    #[instrument(skip(self, payload))]
    pub async fn correlate_webhook(
        self: &Arc<Self>,
        conversation_id: &str,
        payload: Value,
    ) -> Result<bool> {
        let conversation = self.store.get_conversation(conversation_id)?;
        let key = ConversationKey::new(
            conversation.channel_connection_id.clone(),
            conversation.remote_phone.clone(),
        );

        let _guard = self.store.lock_conversation(conversation_id).await;
        let Some(mut session) = self.sessions.get(&key)? else {
            return Ok(false);
        };
        let flow = self.catalog.get(&session.flow_id)?;
        let parked = matches!(
            flow.node(&session.current_node_id).map(|n| &n.kind),
            Some(NodeKind::WebhookIn)
        );
        if !parked {
            return Ok(false);
        }

        session.variables.insert("webhook".into(), payload);
        let mut ctx = StepCtx::new();
        self.continue_from(
            &flow,
            &conversation,
            &mut session,
            Some(handle::DEFAULT.to_string()),
            &mut ctx,
        )
        .await?;
        Ok(true)
    }

    // ── Step orchestration ──────────────────────────────────────────────

    async fn start_entry_flow(
        self: &Arc<Self>,
        connection: &ChannelConnection,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> Result<StepEnd> {
        let flow = match self
            .catalog
            .resolve_entry(connection.default_flow_id.as_deref())
        {
            Ok(flow) => flow,
            Err(chasqui_flows::FlowError::NoEntryFlow) => {
                // No bot configured for this line: straight to the queue.
                if let Some(queue_id) = &connection.default_queue_id {
                    self.store.enqueue(&conversation.id, queue_id)?;
                    self.queue.handle().trigger(QueueTrigger::ChatQueued {
                        queue_id: queue_id.clone(),
                    });
                }
                return Ok(StepEnd::NoStep);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(start) = flow.start_node() else {
            warn!(flow_id = %flow.id, "flow has no start node");
            return Ok(StepEnd::NoStep);
        };

        self.store.start_bot(&conversation.id, &flow.id)?;
        let conversation = self.store.get_conversation(&conversation.id)?;

        let key = ConversationKey::new(
            conversation.channel_connection_id.clone(),
            conversation.remote_phone.clone(),
        );
        let mut session = BotSession::new(key, &flow.id, &start.id);
        if let Some(text) = user_text(event) {
            session.set_variable(LAST_INPUT_VAR, text);
        }

        info!(conversation_id = %conversation.id, flow_id = %flow.id, "entry flow started");
        let mut ctx = StepCtx::new();
        self.continue_from(&flow, &conversation, &mut session, None, &mut ctx)
            .await
    }

    async fn run_bot_turn(
        self: &Arc<Self>,
        conversation: &Conversation,
        session: Option<BotSession>,
        event: Option<&InboundEvent>,
    ) -> Result<StepEnd> {
        let key = ConversationKey::new(
            conversation.channel_connection_id.clone(),
            conversation.remote_phone.clone(),
        );

        let mut session = match session {
            Some(session) => session,
            None => {
                // Bot flags set but no session row, crash recovery:
                // restart the flow from its start node.
                let Some(flow_id) = conversation.bot_flow_id.clone() else {
                    warn!(conversation_id = %conversation.id, "bot-owned without flow id, clearing");
                    self.store.force_bot_consistency(&conversation.id, None)?;
                    return Ok(StepEnd::NoStep);
                };
                let flow = self.catalog.get(&flow_id)?;
                let Some(start) = flow.start_node() else {
                    return Ok(StepEnd::NoStep);
                };
                warn!(conversation_id = %conversation.id, "session missing, restarting flow");
                BotSession::new(key.clone(), &flow_id, &start.id)
            }
        };

        let flow = self.catalog.get(&session.flow_id)?;
        if let Some(text) = event.and_then(user_text) {
            session.set_variable(LAST_INPUT_VAR, text);
        }
        session.last_activity_at = now_millis();

        let mut ctx = StepCtx::new();

        // Suspended at a delay node?
        if session.wake_at.is_some() {
            let interruptible = matches!(
                flow.node(&session.current_node_id).map(|n| &n.kind),
                Some(NodeKind::Delay(d)) if d.interruptible
            );
            if interruptible && event.and_then(user_text).is_some() {
                session.wake_at = None;
                return self
                    .continue_from(
                        &flow,
                        conversation,
                        &mut session,
                        Some(handle::DEFAULT.to_string()),
                        &mut ctx,
                    )
                    .await;
            }
            // Non-interruptible: record the message, keep sleeping.
            self.sessions.put(&session)?;
            return Ok(StepEnd::Suspended);
        }

        // Waiting for input?
        if session.awaiting != Awaiting::None {
            let Some(event) = event else {
                self.sessions.put(&session)?;
                return Ok(StepEnd::Waiting);
            };
            let node = flow
                .node(&session.current_node_id)
                .cloned()
                .ok_or_else(|| EngineError::Node {
                    node_id: session.current_node_id.clone(),
                    reason: "current node no longer exists".into(),
                })?;

            match self
                .handle_awaited_input(&flow, &node, conversation, &mut session, event, &mut ctx)
                .await?
            {
                InputOutcome::Follow(next) => {
                    session.awaiting = Awaiting::None;
                    session.retry_count = 0;
                    return self
                        .continue_from(&flow, conversation, &mut session, Some(next), &mut ctx)
                        .await;
                }
                InputOutcome::ReExecute => {
                    session.awaiting = Awaiting::None;
                    return self
                        .continue_from(&flow, conversation, &mut session, None, &mut ctx)
                        .await;
                }
                InputOutcome::Retry => {
                    session.retry_count += 1;
                    let max_retries = node_max_retries(&node);
                    if session.retry_count > max_retries {
                        return self
                            .continue_from(
                                &flow,
                                conversation,
                                &mut session,
                                Some(handle::ERROR.to_string()),
                                &mut ctx,
                            )
                            .await;
                    }
                    let retry_text = node_retry_message(&node)
                        .unwrap_or_else(|| DEFAULT_RETRY_MESSAGE.to_string());
                    let retry_text =
                        substitute(&retry_text, &session.variables, ctx.crm_fields.as_ref());
                    self.sender
                        .deliver(
                            &conversation.id,
                            &OutboundMessage::Text { body: retry_text },
                            ASSIGNED_BOT,
                        )
                        .await?;
                    self.sessions.put(&session)?;
                    return Ok(StepEnd::Waiting);
                }
            }
        }

        // Fresh session (or input-less re-entry): execute the current node.
        self.continue_from(&flow, conversation, &mut session, None, &mut ctx)
            .await
    }

    /// Traverse nodes until the step ends. `next` is the handle to follow
    /// out of the current node; `None` executes the current node itself.
    async fn continue_from(
        self: &Arc<Self>,
        flow: &FlowDefinition,
        conversation: &Conversation,
        session: &mut BotSession,
        mut next: Option<String>,
        ctx: &mut StepCtx,
    ) -> Result<StepEnd> {
        for _ in 0..MAX_NODES_PER_STEP {
            if let Some(handle_name) = next.take() {
                let Some(target) = flow.successor(&session.current_node_id, &handle_name) else {
                    return self
                        .leave_flow(
                            flow,
                            conversation,
                            session,
                            &format!(
                                "sin salida '{handle_name}' en el nodo {}",
                                session.current_node_id
                            ),
                            handle_name == handle::ERROR,
                        )
                        .await;
                };
                let target_id = target.id.clone();
                session.visit(&target_id);
            }

            let node = flow
                .node(&session.current_node_id)
                .cloned()
                .ok_or_else(|| EngineError::Node {
                    node_id: session.current_node_id.clone(),
                    reason: "node vanished mid-step".into(),
                })?;

            // Per-node materialization pause (distinct from delay nodes).
            if let Some(secs) = node.delay_seconds {
                tokio::time::sleep(Duration::from_secs(secs.min(10))).await;
            }

            let advance = match self.execute_node(flow, &node, conversation, session, ctx).await {
                Ok(advance) => advance,
                Err(EngineError::Store(e)) => return Err(EngineError::Store(e)),
                Err(e) => {
                    // Pure node errors route out:error when wired, else
                    // the conversation falls back to a human queue.
                    warn!(node_id = %node.id, error = %e, "node error");
                    if flow.has_handle(&node.id, handle::ERROR) {
                        next = Some(handle::ERROR.to_string());
                        continue;
                    }
                    return self
                        .leave_flow(flow, conversation, session, &e.to_string(), true)
                        .await;
                }
            };

            match advance {
                Advance::Goto(handle_name) => {
                    next = Some(handle_name);
                }
                Advance::Wait(awaiting) => {
                    session.awaiting = awaiting;
                    self.sessions.put(session)?;
                    return Ok(StepEnd::Waiting);
                }
                Advance::Suspend { wake_at_ms } => {
                    session.wake_at = Some(wake_at_ms);
                    session.awaiting = Awaiting::None;
                    self.sessions.put(session)?;
                    let delay = (wake_at_ms - now_millis()).max(0) as u64;
                    self.spawn_wake(session.key.clone(), Duration::from_millis(delay));
                    return Ok(StepEnd::Suspended);
                }
                Advance::Park => {
                    session.awaiting = Awaiting::None;
                    self.sessions.put(session)?;
                    return Ok(StepEnd::Parked);
                }
                Advance::Transferred => return Ok(StepEnd::Transferred),
                Advance::Ended => return Ok(StepEnd::Ended),
            }
        }

        self.leave_flow(
            flow,
            conversation,
            session,
            "el flujo excedió el límite de nodos por paso",
            true,
        )
        .await
    }

    /// Abandon the flow: fallback-transfer when the flow names a queue
    /// (always for errors), otherwise end quietly.
    async fn leave_flow(
        self: &Arc<Self>,
        flow: &FlowDefinition,
        conversation: &Conversation,
        session: &mut BotSession,
        reason: &str,
        is_error: bool,
    ) -> Result<StepEnd> {
        match &flow.fallback_queue_id {
            Some(queue_id) if is_error => {
                warn!(conversation_id = %conversation.id, reason, "flow error, transferring to fallback");
                self.queue
                    .transfer_to_queue_locked(&conversation.id, queue_id, None, None)?;
                Ok(StepEnd::Transferred)
            }
            _ => {
                debug!(conversation_id = %conversation.id, reason, "flow ended without terminal node");
                self.sessions.delete_if_exists(&session.key)?;
                self.store.force_bot_consistency(&conversation.id, None)?;
                Ok(StepEnd::Ended)
            }
        }
    }

    // ── Node semantics ──────────────────────────────────────────────────

    async fn execute_node(
        self: &Arc<Self>,
        _flow: &FlowDefinition,
        node: &FlowNode,
        conversation: &Conversation,
        session: &mut BotSession,
        ctx: &mut StepCtx,
    ) -> Result<Advance> {
        match &node.kind {
            NodeKind::Start => Ok(Advance::Goto(handle::DEFAULT.to_string())),

            NodeKind::Message(msg) => {
                let crm = self.crm_fields(conversation, ctx).await;
                let body = substitute(&msg.text, &session.variables, crm);
                self.sender
                    .deliver(&conversation.id, &OutboundMessage::Text { body }, ASSIGNED_BOT)
                    .await?;
                Ok(Advance::Goto(handle::DEFAULT.to_string()))
            }

            NodeKind::Buttons(buttons) => {
                let crm = self.crm_fields(conversation, ctx).await;
                let prompt = substitute(&buttons.prompt, &session.variables, crm);
                let options = option_list(&buttons.options);
                self.sender
                    .deliver(&conversation.id, &buttons_or_list(prompt, options), ASSIGNED_BOT)
                    .await?;
                session.retry_count = 0;
                Ok(Advance::Wait(Awaiting::Buttons))
            }

            NodeKind::Menu(menu) => {
                let crm = self.crm_fields(conversation, ctx).await;
                let prompt = substitute(&menu.prompt, &session.variables, crm);
                let outbound = match menu.mode {
                    // Menus are always a list payload, however few options.
                    MenuMode::Interactive => OutboundMessage::List {
                        body: prompt,
                        button_label: "Ver opciones".to_string(),
                        options: option_list(&menu.options),
                    },
                    MenuMode::Text => {
                        let mut body = prompt;
                        for (i, option) in menu.options.iter().enumerate() {
                            body.push_str(&format!("\n{}. {}", i + 1, option.label));
                        }
                        OutboundMessage::Text { body }
                    }
                };
                self.sender
                    .deliver(&conversation.id, &outbound, ASSIGNED_BOT)
                    .await?;
                session.retry_count = 0;
                Ok(Advance::Wait(Awaiting::Choice))
            }

            NodeKind::Question(question) => {
                let crm = self.crm_fields(conversation, ctx).await;
                let prompt = substitute(&question.prompt, &session.variables, crm);
                self.sender
                    .deliver(&conversation.id, &OutboundMessage::Text { body: prompt }, ASSIGNED_BOT)
                    .await?;
                session.retry_count = 0;
                Ok(Advance::Wait(match question.input {
                    QuestionInput::Text => Awaiting::Text,
                    QuestionInput::Media => Awaiting::Media,
                }))
            }

            NodeKind::Validation(validation) => {
                let input = session.variable_str(LAST_INPUT_VAR).unwrap_or_default();
                match validate::validate(&validation.mode, &input, &session.variables) {
                    Ok(true) => Ok(Advance::Goto(handle::MATCH.to_string())),
                    Ok(false) => Ok(Advance::Goto(handle::NO_MATCH.to_string())),
                    Err(reason) => Err(EngineError::Node {
                        node_id: node.id.clone(),
                        reason,
                    }),
                }
            }

            NodeKind::Condition(cond) => {
                let input = session.variable_str(LAST_INPUT_VAR).unwrap_or_default();
                let crm = self.crm_fields(conversation, ctx).await;
                let hit = condition::evaluate(cond, &input, &session.variables, crm);
                Ok(Advance::Goto(
                    if hit { handle::DEFAULT } else { handle::NO_MATCH }.to_string(),
                ))
            }

            NodeKind::Attachment(attachment) => {
                let media_type = match attachment.media_type {
                    chasqui_flows::node::AttachmentKind::Image => MediaType::Image,
                    chasqui_flows::node::AttachmentKind::Audio => MediaType::Audio,
                    chasqui_flows::node::AttachmentKind::Video => MediaType::Video,
                    chasqui_flows::node::AttachmentKind::Document => MediaType::Document,
                };
                let outbound = OutboundMessage::Media {
                    media: OutboundMedia::from_source(&attachment.source),
                    media_type,
                    caption: attachment.caption.clone(),
                };
                self.sender
                    .deliver(&conversation.id, &outbound, ASSIGNED_BOT)
                    .await?;
                Ok(Advance::Goto(handle::DEFAULT.to_string()))
            }

            NodeKind::Delay(delay) => Ok(Advance::Suspend {
                wake_at_ms: now_millis() + (delay.delay_seconds as i64) * 1000,
            }),

            NodeKind::Scheduler(scheduler) => {
                let schedule = match scheduler.source {
                    ScheduleSource::Queue => {
                        let queue_id = scheduler
                            .queue_id
                            .clone()
                            .or_else(|| conversation.queue_id.clone());
                        match queue_id {
                            Some(queue_id) => {
                                self.store.get_queue(&queue_id).ok().and_then(|q| q.schedule)
                            }
                            None => None,
                        }
                    }
                    ScheduleSource::Crm => match (&self.crm, &scheduler.queue_type) {
                        (Some(crm), Some(queue_type)) => crm
                            .fetch_schedule(queue_type)
                            .await
                            .ok()
                            .flatten(),
                        _ => None,
                    },
                };
                // No schedule configured means always open.
                let in_hours = schedule
                    .map(|s| {
                        chasqui_core::hours::evaluate(
                            &s,
                            chrono::Utc::now(),
                            self.locale_offset_minutes,
                        )
                        .is_open
                    })
                    .unwrap_or(true);
                Ok(Advance::Goto(
                    if in_hours { handle::IN_HOURS } else { handle::OUT_OF_HOURS }.to_string(),
                ))
            }

            NodeKind::WebhookOut(webhook) => {
                match self.call_webhook(webhook, session, ctx).await {
                    Ok(()) => Ok(Advance::Goto(handle::SUCCESS.to_string())),
                    Err(reason) => {
                        warn!(node_id = %node.id, %reason, "webhook_out failed");
                        Ok(Advance::Goto(handle::ERROR.to_string()))
                    }
                }
            }

            NodeKind::WebhookIn => Ok(Advance::Park),

            NodeKind::Transfer(transfer) => {
                self.queue.transfer_to_queue_locked(
                    &conversation.id,
                    &transfer.queue_id,
                    transfer.reason.as_deref(),
                    None,
                )?;
                Ok(Advance::Transferred)
            }

            NodeKind::End(end) => {
                self.sessions.delete_if_exists(&session.key)?;
                if end.close_conversation {
                    self.store.close(&conversation.id, None)?;
                } else {
                    self.store.force_bot_consistency(&conversation.id, None)?;
                }
                Ok(Advance::Ended)
            }

            NodeKind::Agent(agent_node) => {
                self.run_agent_node(agent_node, conversation, session).await
            }
        }
    }

    async fn handle_awaited_input(
        self: &Arc<Self>,
        _flow: &FlowDefinition,
        node: &FlowNode,
        _conversation: &Conversation,
        session: &mut BotSession,
        event: &InboundEvent,
        _ctx: &mut StepCtx,
    ) -> Result<InputOutcome> {
        match &node.kind {
            NodeKind::Buttons(buttons) => {
                Ok(match_option(&event.kind, &buttons.options)
                    .map(|i| InputOutcome::Follow(handle::option(i)))
                    .unwrap_or(InputOutcome::Retry))
            }

            NodeKind::Menu(menu) => {
                if let Some(i) = match_option(&event.kind, &menu.options) {
                    return Ok(InputOutcome::Follow(handle::option(i)));
                }
                // Text-mode menus accept the typed digit.
                if let Some(text) = event.kind.user_text() {
                    if let Ok(n) = text.trim().parse::<usize>() {
                        if (1..=menu.options.len()).contains(&n) {
                            return Ok(InputOutcome::Follow(handle::option(n - 1)));
                        }
                    }
                }
                Ok(InputOutcome::Retry)
            }

            NodeKind::Question(question) => match question.input {
                QuestionInput::Media => match &event.kind {
                    InboundKind::Media { media, .. } => {
                        session.set_variable(&question.var_name, media.provider_media_id.clone());
                        Ok(InputOutcome::Follow(handle::DEFAULT.to_string()))
                    }
                    _ => Ok(InputOutcome::Retry),
                },
                QuestionInput::Text => {
                    let Some(text) = event.kind.user_text() else {
                        return Ok(InputOutcome::Retry);
                    };
                    if let Some(mode) = &question.validation {
                        match validate::validate(mode, text, &session.variables) {
                            Ok(true) => {}
                            Ok(false) => return Ok(InputOutcome::Retry),
                            Err(_) => return Ok(InputOutcome::Follow(handle::ERROR.to_string())),
                        }
                    }
                    session.set_variable(&question.var_name, text.to_string());
                    Ok(InputOutcome::Follow(handle::DEFAULT.to_string()))
                }
            },

            // Conversation continues with the agent on every user turn.
            NodeKind::Agent(_) => Ok(InputOutcome::ReExecute),

            _ => {
                warn!(node_id = %node.id, "awaiting input at a non-input node");
                Ok(InputOutcome::Follow(handle::DEFAULT.to_string()))
            }
        }
    }

    async fn run_agent_node(
        self: &Arc<Self>,
        node: &chasqui_flows::node::AgentNode,
        conversation: &Conversation,
        session: &mut BotSession,
    ) -> Result<Advance> {
        let Some(wiring) = &self.agent else {
            return Err(EngineError::Node {
                node_id: session.current_node_id.clone(),
                reason: "agent runtime is not configured".into(),
            });
        };

        let user_text = session.variable_str(LAST_INPUT_VAR).unwrap_or_default();
        let history: Vec<Value> = session
            .variables
            .get(AGENT_HISTORY_VAR)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let ctx = Arc::new(AgentContext::new(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(SinkAdapter {
                sender: self.sender.clone(),
            }),
            conversation.id.clone(),
            session.key.clone(),
            self.crm.clone(),
            wiring.ocr.clone(),
            wiring.knowledge.clone(),
            wiring.catalog_base_url.clone(),
            self.locale_offset_minutes,
        ));

        let result = wiring
            .runtime
            .run_turn(
                ctx.clone(),
                &node.system_prompt,
                node.model.as_deref(),
                history.clone(),
                &user_text,
            )
            .await?;

        match result.outcome {
            TurnOutcome::Continue => {
                let mut history = history;
                history.push(serde_json::json!({ "role": "user", "content": user_text }));
                if let Some(reply) = &result.reply {
                    self.sender
                        .deliver(
                            &conversation.id,
                            &OutboundMessage::Text { body: reply.clone() },
                            ASSIGNED_BOT,
                        )
                        .await?;
                    history.push(serde_json::json!({ "role": "assistant", "content": reply }));
                }
                if history.len() > AGENT_HISTORY_MAX {
                    let overflow = history.len() - AGENT_HISTORY_MAX;
                    history.drain(..overflow);
                }
                session
                    .variables
                    .insert(AGENT_HISTORY_VAR.into(), Value::Array(history));
                Ok(Advance::Wait(Awaiting::Text))
            }
            TurnOutcome::Transferred { .. } => Ok(Advance::Transferred),
            TurnOutcome::Ended { close_conversation } => {
                self.sessions.delete_if_exists(&session.key)?;
                if close_conversation {
                    self.store.close(&conversation.id, None)?;
                } else {
                    self.store.force_bot_consistency(&conversation.id, None)?;
                }
                Ok(Advance::Ended)
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn append_inbound(&self, conversation: &Conversation, event: &InboundEvent) -> Result<()> {
        let new = match &event.kind {
            InboundKind::Text { body } => NewMessage {
                direction: Some(Direction::In),
                msg_type: Some(MessageType::Text),
                text: Some(body.clone()),
                provider_message_id: event.provider_message_id.clone(),
                ..Default::default()
            },
            InboundKind::Media { media, caption, media_type } => NewMessage {
                direction: Some(Direction::In),
                msg_type: Some(MessageType::Media),
                text: caption.clone(),
                media_url: Some(media.provider_media_id.clone()),
                provider_message_id: event.provider_message_id.clone(),
                provider_metadata: Some(serde_json::json!({
                    "media_type": media_type.as_str(),
                    "mime_type": media.mime_type,
                })),
                ..Default::default()
            },
            InboundKind::ButtonReply { id, title } | InboundKind::ListReply { id, title } => {
                NewMessage {
                    direction: Some(Direction::In),
                    msg_type: Some(MessageType::Text),
                    text: Some(title.clone()),
                    provider_message_id: event.provider_message_id.clone(),
                    provider_metadata: Some(serde_json::json!({ "reply_id": id })),
                    ..Default::default()
                }
            }
            InboundKind::Unsupported { type_name } => NewMessage {
                direction: Some(Direction::In),
                msg_type: Some(MessageType::Text),
                text: Some(format!("[{type_name} no soportado]")),
                provider_message_id: event.provider_message_id.clone(),
                ..Default::default()
            },
            InboundKind::StatusUpdate { .. } => return Ok(()),
        };
        self.store.append_message(&conversation.id, new)?;
        Ok(())
    }

    async fn crm_fields<'a>(
        &self,
        conversation: &Conversation,
        ctx: &'a mut StepCtx,
    ) -> Option<&'a Map<String, Value>> {
        if !ctx.crm_fetched {
            ctx.crm_fetched = true;
            if let Some(crm) = &self.crm {
                match crm.lookup_contact(&conversation.remote_phone).await {
                    Ok(Some(contact)) => ctx.crm_fields = Some(contact.fields),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "CRM lookup failed, tokens stay literal"),
                }
            }
        }
        ctx.crm_fields.as_ref()
    }

    async fn call_webhook(
        &self,
        webhook: &chasqui_flows::node::WebhookOutNode,
        session: &mut BotSession,
        ctx: &StepCtx,
    ) -> std::result::Result<(), String> {
        let url = substitute(&webhook.url, &session.variables, ctx.crm_fields.as_ref());
        let body = webhook
            .body
            .as_ref()
            .map(|b| substitute_json(b, &session.variables, ctx.crm_fields.as_ref()));

        let mut attempt = 0usize;
        let response = loop {
            let mut req = match webhook.method {
                chasqui_flows::node::HttpMethod::Get => self.http.get(&url),
                chasqui_flows::node::HttpMethod::Post => self.http.post(&url),
            };
            for (name, value) in &webhook.headers {
                req = req.header(name, value);
            }
            if let Some(body) = &body {
                req = req.json(body);
            }

            let result = req
                .timeout(Duration::from_secs(
                    chasqui_core::config::PROVIDER_TIMEOUT_SECS,
                ))
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => break resp,
                Ok(resp)
                    if attempt < WEBHOOK_BACKOFF_MS.len()
                        && (resp.status().is_server_error()
                            || resp.status().as_u16() == 408
                            || resp.status().as_u16() == 429) =>
                {
                    tokio::time::sleep(jittered(WEBHOOK_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                }
                Ok(resp) => return Err(format!("webhook returned {}", resp.status())),
                Err(_) if attempt < WEBHOOK_BACKOFF_MS.len() => {
                    tokio::time::sleep(jittered(WEBHOOK_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                }
                Err(e) => return Err(format!("webhook request failed: {e}")),
            }
        };

        if webhook.capture.is_empty() {
            return Ok(());
        }
        let json: Value = response
            .json()
            .await
            .map_err(|e| format!("webhook response is not JSON: {e}"))?;
        for (var, pointer) in &webhook.capture {
            if let Some(value) = json.pointer(pointer) {
                session.variables.insert(var.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn spawn_wake(self: &Arc<Self>, key: ConversationKey, delay: Duration) {
        let runtime = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = runtime.resume_wakeup(&key).await {
                warn!(key = %key, error = %e, "delay resume failed");
            }
        });
    }
}

/// `MessageSink` adapter so agent tools send through the same ordered
/// delivery path as flow nodes.
struct SinkAdapter {
    sender: Arc<dyn OutboundSender>,
}

#[async_trait::async_trait]
impl MessageSink for SinkAdapter {
    async fn send(
        &self,
        conversation_id: &str,
        msg: &OutboundMessage,
    ) -> chasqui_core::Result<()> {
        self.sender
            .deliver(conversation_id, msg, ASSIGNED_BOT)
            .await
            .map(|_| ())
    }
}

fn user_text(event: &InboundEvent) -> Option<String> {
    match &event.kind {
        InboundKind::Media { caption, .. } => caption.clone(),
        other => other.user_text().map(str::to_string),
    }
}

fn option_list(options: &[chasqui_flows::node::NodeOption]) -> Vec<ButtonOption> {
    options
        .iter()
        .enumerate()
        .map(|(i, o)| ButtonOption {
            id: format!("opt:{i}"),
            label: o.label.clone(),
        })
        .collect()
}

/// Match a reply to an option index: by reply id (`opt:<i>`), else by
/// case-folded title.
fn match_option(kind: &InboundKind, options: &[chasqui_flows::node::NodeOption]) -> Option<usize> {
    if let Some(reply_id) = kind.reply_id() {
        if let Some(i) = reply_id.strip_prefix("opt:").and_then(|s| s.parse::<usize>().ok()) {
            if i < options.len() {
                return Some(i);
            }
        }
    }
    let text = kind.user_text()?.trim().to_lowercase();
    options
        .iter()
        .position(|o| o.label.to_lowercase() == text)
}

fn node_max_retries(node: &FlowNode) -> u32 {
    match &node.kind {
        NodeKind::Buttons(b) => b.max_retries,
        NodeKind::Menu(m) => m.max_retries,
        NodeKind::Question(q) => q.max_retries,
        _ => 3,
    }
}

fn node_retry_message(node: &FlowNode) -> Option<String> {
    match &node.kind {
        NodeKind::Buttons(b) => b.retry_message.clone(),
        NodeKind::Menu(m) => m.retry_message.clone(),
        NodeKind::Question(q) => q.retry_message.clone(),
        _ => None,
    }
}

fn substitute_json(
    value: &Value,
    variables: &Map<String, Value>,
    crm: Option<&Map<String, Value>>,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, variables, crm)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_json(v, variables, crm))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_json(v, variables, crm)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn jittered(base_ms: u64) -> Duration {
    let spread = base_ms / 5;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms - spread..=base_ms + spread))
}
