use serde::{Deserialize, Serialize};

/// Conversation lifecycle. `Attending` is distinct from `Active`: an
/// attending conversation has a human advisor on it, an active one is
/// bot-owned or waiting in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Attending,
    Archived,
    Closed,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Attending => "attending",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConversationStatus::Active),
            "attending" => Ok(ConversationStatus::Attending),
            "archived" => Ok(ConversationStatus::Archived),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Logical channel name; only "whatsapp" today.
    pub channel: String,
    /// Canonical provider phone-number-id.
    pub channel_connection_id: String,
    pub remote_phone: String,
    /// `+` + digits.
    pub display_number: String,
    pub contact_name: Option<String>,
    pub status: ConversationStatus,
    /// Advisor id, or the `"bot"` sentinel, or `None` while queued.
    pub assigned_to: Option<String>,
    pub assigned_at: Option<i64>,
    pub queued_at: Option<i64>,
    pub queue_id: Option<String>,
    pub bot_flow_id: Option<String>,
    pub bot_started_at: Option<i64>,
    /// Monotonic display counter, assigned once at creation.
    pub ticket_number: i64,
    /// Every advisor who ever attended this conversation.
    pub attended_by: Vec<String>,
    pub active_advisors: Vec<String>,
    pub transferred_from: Option<String>,
    pub transferred_at: Option<i64>,
    /// Escalation level for the queue-timeout scheduler; resets when the
    /// advisor replies.
    pub queue_timeout_level: i64,
    pub unread: i64,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn is_bot_owned(&self) -> bool {
        self.assigned_to.as_deref() == Some(chasqui_core::types::ASSIGNED_BOT)
            || self.bot_flow_id.is_some()
            || self.bot_started_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Buttons,
    Media,
    Template,
    System,
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Buttons => "buttons",
            MessageType::Media => "media",
            MessageType::Template => "template",
            MessageType::System => "system",
            MessageType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "buttons" => Some(MessageType::Buttons),
            "media" => Some(MessageType::Media),
            "template" => Some(MessageType::Template),
            "system" => Some(MessageType::System),
            "event" => Some(MessageType::Event),
            _ => None,
        }
    }
}

/// Delivery state. Transitions are monotone along
/// pending → sent → delivered → read; `failed` replaces any forward step
/// and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition. Illegal
    /// transitions (late or duplicate provider updates) are ignored, not
    /// errors.
    pub fn can_advance(&self, to: MessageStatus) -> bool {
        match (self, to) {
            (MessageStatus::Failed, _) | (MessageStatus::Read, MessageStatus::Failed) => false,
            (_, MessageStatus::Failed) => true,
            (from, to) => to.rank() == from.rank() + 1 || to.rank() > from.rank(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub msg_type: MessageType,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_thumb: Option<String>,
    pub replied_to_id: Option<String>,
    pub status: MessageStatus,
    /// Epoch millis.
    pub timestamp: i64,
    /// For `event` messages: what happened (transfer, release, …).
    pub event_type: Option<String>,
    /// Advisor id for operator sends, `"bot"` for flow sends.
    pub sent_by: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_metadata: Option<serde_json::Value>,
}

/// Input for `append_message`, ids, timestamps and status are assigned by
/// the store.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub direction: Option<Direction>,
    pub msg_type: Option<MessageType>,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub media_thumb: Option<String>,
    pub replied_to_id: Option<String>,
    pub event_type: Option<String>,
    pub sent_by: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_metadata: Option<serde_json::Value>,
    /// Initial status; defaults to `Pending` for out, `Sent` for in.
    pub status: Option<MessageStatus>,
}

impl NewMessage {
    pub fn inbound_text(body: impl Into<String>, provider_message_id: impl Into<String>) -> Self {
        Self {
            direction: Some(Direction::In),
            msg_type: Some(MessageType::Text),
            text: Some(body.into()),
            provider_message_id: Some(provider_message_id.into()),
            ..Default::default()
        }
    }

    pub fn outbound_text(body: impl Into<String>, sent_by: impl Into<String>) -> Self {
        Self {
            direction: Some(Direction::Out),
            msg_type: Some(MessageType::Text),
            text: Some(body.into()),
            sent_by: Some(sent_by.into()),
            ..Default::default()
        }
    }

    /// System event row (transfer, release, failure notes).
    pub fn system_event(event_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            direction: Some(Direction::Out),
            msg_type: Some(MessageType::Event),
            event_type: Some(event_type.into()),
            text: Some(text.into()),
            status: Some(MessageStatus::Sent),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub kind: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub filename: String,
    pub mimetype: String,
    pub size: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_forward_only() {
        assert!(MessageStatus::Pending.can_advance(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_advance(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_advance(MessageStatus::Read)); // skipping is fine
        assert!(!MessageStatus::Delivered.can_advance(MessageStatus::Sent));
        assert!(!MessageStatus::Read.can_advance(MessageStatus::Delivered));
    }

    #[test]
    fn failed_is_terminal() {
        assert!(MessageStatus::Pending.can_advance(MessageStatus::Failed));
        assert!(MessageStatus::Delivered.can_advance(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.can_advance(MessageStatus::Sent));
        assert!(!MessageStatus::Failed.can_advance(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance(MessageStatus::Failed));
    }

    #[test]
    fn conversation_status_roundtrip() {
        for s in ["active", "attending", "archived", "closed"] {
            let parsed: ConversationStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("pending".parse::<ConversationStatus>().is_err());
    }
}
