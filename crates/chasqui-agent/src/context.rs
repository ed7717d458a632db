//! Shared context handed to every tool: store and queue handles, the
//! outbound sink, external adapters, and the turn outcome the loop reads
//! back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chasqui_core::types::ConversationKey;
use chasqui_queue::QueueEngine;
use chasqui_store::Store;
use chasqui_wire::crm::CrmAdapter;
use chasqui_wire::outbound::OutboundMessage;

use crate::adapters::{KnowledgeIndex, OcrAdapter};

/// How a tool sends messages to the end user. Implemented by the flow
/// engine's materializer so agent sends get the same persist-then-ack
/// ordering as flow nodes.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, conversation_id: &str, msg: &OutboundMessage) -> chasqui_core::Result<()>;
}

/// What the turn did to the conversation. Tools set this; the loop stops
/// on anything but `Continue`, and the engine acts on it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnOutcome {
    #[default]
    Continue,
    Transferred {
        queue_id: String,
    },
    Ended {
        close_conversation: bool,
    },
}

pub struct AgentContext {
    pub store: Arc<Store>,
    pub queue: Arc<QueueEngine>,
    pub sink: Arc<dyn MessageSink>,
    pub conversation_id: String,
    pub conversation_key: ConversationKey,
    pub crm: Option<Arc<dyn CrmAdapter>>,
    pub ocr: Option<Arc<dyn OcrAdapter>>,
    pub knowledge: Option<Arc<dyn KnowledgeIndex>>,
    /// Base URL catalog PDFs are served from.
    pub catalog_base_url: String,
    pub locale_offset_minutes: i32,
    outcome: Mutex<TurnOutcome>,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<QueueEngine>,
        sink: Arc<dyn MessageSink>,
        conversation_id: impl Into<String>,
        conversation_key: ConversationKey,
        crm: Option<Arc<dyn CrmAdapter>>,
        ocr: Option<Arc<dyn OcrAdapter>>,
        knowledge: Option<Arc<dyn KnowledgeIndex>>,
        catalog_base_url: impl Into<String>,
        locale_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            queue,
            sink,
            conversation_id: conversation_id.into(),
            conversation_key,
            crm,
            ocr,
            knowledge,
            catalog_base_url: catalog_base_url.into(),
            locale_offset_minutes,
            outcome: Mutex::new(TurnOutcome::Continue),
        }
    }

    pub fn set_outcome(&self, outcome: TurnOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn outcome(&self) -> TurnOutcome {
        self.outcome.lock().unwrap().clone()
    }

    /// Map an agent-facing queue type to a configured queue id. The
    /// catalogue names are fixed; deployments name their queues in Spanish
    /// or English.
    pub fn resolve_queue_id(&self, queue_type: &str) -> chasqui_core::Result<String> {
        let candidates: &[&str] = match queue_type {
            "sales" => &["Ventas", "Sales"],
            "support" => &["Soporte", "Support"],
            "prospects" => &["Prospectos", "Prospects"],
            other => {
                return Err(chasqui_core::ChasquiError::Validation(format!(
                    "unknown queue_type: {other}"
                )))
            }
        };
        for name in candidates {
            if let Some(queue) = self.store.find_queue_by_name(name).map_err(chasqui_core::ChasquiError::from)? {
                return Ok(queue.id);
            }
        }
        Err(chasqui_core::ChasquiError::NotFound(format!(
            "queue for type {queue_type}"
        )))
    }
}
