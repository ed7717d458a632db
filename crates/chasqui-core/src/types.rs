use serde::{Deserialize, Serialize};

use crate::error::{ChasquiError, Result};

/// Sentinel stored in `conversations.assigned_to` while the flow bot owns
/// the conversation.
pub const ASSIGNED_BOT: &str = "bot";

/// Wall-clock milliseconds, the timestamp unit for `updated_at` and
/// ordering-sensitive columns.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Canonical identity of a conversation: the provider phone-number-id of
/// the channel connection plus the customer's phone.
///
/// Wire format: `conn:{channel_connection_id}:phone:{remote_phone}`, also
/// the bot-session primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Provider phone-number-id (never a local alias UUID).
    pub channel_connection_id: String,
    pub remote_phone: String,
}

impl ConversationKey {
    pub fn new(channel_connection_id: impl Into<String>, remote_phone: impl Into<String>) -> Self {
        Self {
            channel_connection_id: channel_connection_id.into(),
            remote_phone: remote_phone.into(),
        }
    }

    pub fn format(&self) -> String {
        format!(
            "conn:{}:phone:{}",
            self.channel_connection_id, self.remote_phone
        )
    }

    /// Parse the wire format back. Expects exactly `conn:<id>:phone:<phone>`.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("conn:")
            .ok_or_else(|| ChasquiError::Validation(format!("missing 'conn:' prefix: {s}")))?;

        let marker = ":phone:";
        let pos = rest
            .find(marker)
            .ok_or_else(|| ChasquiError::Validation(format!("missing ':phone:' segment: {s}")))?;

        let channel_connection_id = &rest[..pos];
        let remote_phone = &rest[pos + marker.len()..];

        if channel_connection_id.is_empty() || remote_phone.is_empty() {
            return Err(ChasquiError::Validation(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(Self {
            channel_connection_id: channel_connection_id.to_string(),
            remote_phone: remote_phone.to_string(),
        })
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Normalize a phone number for display: strip everything but digits and
/// prefix with `+`. Idempotent.
pub fn normalize_display_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let key = ConversationKey::new("104858275551234", "51999000001");
        let s = key.format();
        assert_eq!(s, "conn:104858275551234:phone:51999000001");
        assert_eq!(ConversationKey::parse(&s).unwrap(), key);
    }

    #[test]
    fn key_parse_rejects_garbage() {
        assert!(ConversationKey::parse("phone:123").is_err());
        assert!(ConversationKey::parse("conn::phone:123").is_err());
        assert!(ConversationKey::parse("conn:abc:phone:").is_err());
    }

    #[test]
    fn normalize_strips_and_prefixes() {
        assert_eq!(normalize_display_number("+51 999 000 001"), "+51999000001");
        assert_eq!(normalize_display_number("51-999-000-001"), "+51999000001");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_display_number("+51 999 000 001");
        assert_eq!(normalize_display_number(&once), once);
    }
}
