use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{Conversation, Message, MessageStatus};

const CHANGE_BUS_CAPACITY: usize = 1024;

/// A mutation notification, published in the same order the mutations
/// commit. The realtime bus never reads the database directly, it only
/// consumes these.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeRecord {
    MessageNew {
        conversation_id: String,
        message: Message,
    },
    MessageStatus {
        conversation_id: String,
        message_id: String,
        status: MessageStatus,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    /// Advisor-side typing indicator; relayed, never persisted.
    Typing {
        conversation_id: String,
        advisor_id: String,
        state: bool,
    },
}

impl ChangeRecord {
    pub fn conversation_id(&self) -> &str {
        match self {
            ChangeRecord::MessageNew { conversation_id, .. }
            | ChangeRecord::MessageStatus { conversation_id, .. }
            | ChangeRecord::Typing { conversation_id, .. } => conversation_id,
            ChangeRecord::ConversationUpdated { conversation } => &conversation.id,
        }
    }
}

/// Broadcast fan-in for change records.
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeRecord>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeRecord> {
        self.tx.subscribe()
    }

    /// Publish, silently dropping when nobody listens (tests, CLI runs).
    pub fn publish(&self, record: ChangeRecord) {
        let _ = self.tx.send(record);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
