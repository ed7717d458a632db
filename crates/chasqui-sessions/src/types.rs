use chasqui_core::types::{now_millis, ConversationKey};
use serde::{Deserialize, Serialize};

/// What the session is waiting on from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Awaiting {
    #[default]
    None,
    Text,
    Choice,
    Buttons,
    Media,
}

impl Awaiting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Awaiting::None => "none",
            Awaiting::Text => "text",
            Awaiting::Choice => "choice",
            Awaiting::Buttons => "buttons",
            Awaiting::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Awaiting::None),
            "text" => Some(Awaiting::Text),
            "choice" => Some(Awaiting::Choice),
            "buttons" => Some(Awaiting::Buttons),
            "media" => Some(Awaiting::Media),
            _ => None,
        }
    }
}

/// One visited node, kept for debugging and loop detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub node_id: String,
    pub at: i64,
}

/// History ring size. Old entries fall off the front.
pub const HISTORY_MAX: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSession {
    pub key: ConversationKey,
    pub flow_id: String,
    pub current_node_id: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub history: Vec<HistoryEntry>,
    pub awaiting: Awaiting,
    pub retry_count: u32,
    /// Epoch millis at which a suspended delay node resumes. The durable
    /// half of the timer; the in-memory sleep is an optimization.
    pub wake_at: Option<i64>,
    pub created_at: i64,
    pub last_activity_at: i64,
}

impl BotSession {
    pub fn new(key: ConversationKey, flow_id: &str, start_node_id: &str) -> Self {
        let now = now_millis();
        Self {
            key,
            flow_id: flow_id.to_string(),
            current_node_id: start_node_id.to_string(),
            variables: serde_json::Map::new(),
            history: Vec::new(),
            awaiting: Awaiting::None,
            retry_count: 0,
            wake_at: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Record arrival at a node, keeping the history bounded.
    pub fn visit(&mut self, node_id: &str) {
        self.current_node_id = node_id.to_string();
        self.history.push(HistoryEntry {
            node_id: node_id.to_string(),
            at: now_millis(),
        });
        if self.history.len() > HISTORY_MAX {
            let overflow = self.history.len() - HISTORY_MAX;
            self.history.drain(..overflow);
        }
        self.last_activity_at = now_millis();
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    pub fn variable_str(&self, name: &str) -> Option<String> {
        self.variables.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut session = BotSession::new(ConversationKey::new("104", "519"), "f-1", "n-start");
        for i in 0..(HISTORY_MAX + 10) {
            session.visit(&format!("n-{i}"));
        }
        assert_eq!(session.history.len(), HISTORY_MAX);
        // the oldest entries fell off
        assert_eq!(session.history[0].node_id, "n-10");
        assert_eq!(session.current_node_id, format!("n-{}", HISTORY_MAX + 9));
    }

    #[test]
    fn variable_str_renders_non_strings() {
        let mut session = BotSession::new(ConversationKey::new("104", "519"), "f-1", "n-start");
        session.set_variable("nombre", "Ana");
        session.set_variable("edad", 34);
        assert_eq!(session.variable_str("nombre").as_deref(), Some("Ana"));
        assert_eq!(session.variable_str("edad").as_deref(), Some("34"));
        assert!(session.variable_str("nada").is_none());
    }
}
