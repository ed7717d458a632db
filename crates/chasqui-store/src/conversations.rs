//! Conversation and message operations. Every mutation bumps `updated_at`
//! (wall-clock millis) and publishes a change record in commit order.

use std::collections::HashMap;

use chasqui_core::types::{normalize_display_number, now_millis, ConversationKey, ASSIGNED_BOT};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

use crate::changes::ChangeRecord;
use crate::error::{Result, StoreError};
use crate::types::{
    Attachment, Conversation, ConversationStatus, Direction, Message, MessageStatus, MessageType,
    NewMessage,
};
use crate::Store;

const CONV_COLS: &str = "id, channel, channel_connection_id, remote_phone, display_number, \
     contact_name, status, assigned_to, assigned_at, queued_at, queue_id, bot_flow_id, \
     bot_started_at, ticket_number, attended_by, active_advisors, transferred_from, \
     transferred_at, queue_timeout_level, unread, last_message_preview, last_message_at, \
     created_at, updated_at";

const MSG_COLS: &str = "id, conversation_id, direction, msg_type, text, media_url, media_thumb, \
     replied_to_id, status, timestamp, event_type, sent_by, provider_message_id, provider_metadata";

const PREVIEW_MAX: usize = 120;

/// Filter for the operator conversation listing.
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub queue_id: Option<String>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
}

impl Store {
    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {CONV_COLS} FROM conversations WHERE id = ?1"),
            params![id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: "conversation",
            id: id.to_string(),
        })
    }

    /// The at-most-one non-closed conversation for a key.
    pub fn find_active_by_key(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                &format!(
                    "SELECT {CONV_COLS} FROM conversations
                     WHERE channel_connection_id = ?1 AND remote_phone = ?2 AND status != 'closed'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![key.channel_connection_id, key.remote_phone],
                row_to_conversation,
            )
            .optional()?)
    }

    pub fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        let mut sql = format!("SELECT {CONV_COLS} FROM conversations WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        if let Some(queue_id) = &filter.queue_id {
            sql.push_str(" AND queue_id = ?");
            args.push(Box::new(queue_id.clone()));
        }
        if let Some(assigned_to) = &filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            args.push(Box::new(assigned_to.clone()));
        }
        sql.push_str(" ORDER BY COALESCE(last_message_at, created_at) DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(200)));

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_conversation,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Queue backlog, oldest first.
    pub fn list_queued(&self, queue_id: &str) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CONV_COLS} FROM conversations
             WHERE queue_id = ?1 AND status = 'active' AND assigned_to IS NULL
               AND queued_at IS NOT NULL
             ORDER BY queued_at ASC"
        ))?;
        let rows = stmt.query_map(params![queue_id], row_to_conversation)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Conversations with any bot-ownership signal set.
    pub fn list_bot_owned(&self) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {CONV_COLS} FROM conversations
             WHERE status != 'closed'
               AND (bot_flow_id IS NOT NULL OR bot_started_at IS NOT NULL OR assigned_to = ?1)"
        ))?;
        let rows = stmt.query_map(params![ASSIGNED_BOT], row_to_conversation)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_attending(&self) -> Result<Vec<Conversation>> {
        self.list_conversations(&ConversationFilter {
            status: Some(ConversationStatus::Attending),
            limit: Some(10_000),
            ..Default::default()
        })
    }

    /// Violations of `assigned_to = "bot"` ⇔ bot fields set. The scheduler
    /// repairs these; anything non-zero right after a repair pass is a bug.
    pub fn count_bot_divergent(&self) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM conversations
             WHERE status != 'closed'
               AND ((assigned_to = ?1) != (bot_flow_id IS NOT NULL AND bot_started_at IS NOT NULL))",
            params![ASSIGNED_BOT],
            |row| row.get(0),
        )?)
    }

    pub fn attending_count(&self, advisor_id: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM conversations WHERE assigned_to = ?1 AND status = 'attending'",
            params![advisor_id],
            |row| row.get(0),
        )?)
    }

    // ── Inbound upsert ──────────────────────────────────────────────────

    /// Find-or-create the conversation for an inbound event. New
    /// conversations get the next ticket number; existing ones pick up a
    /// contact name when one was missing.
    pub fn upsert_on_inbound(
        &self,
        key: &ConversationKey,
        display_number: Option<&str>,
        contact_name: Option<&str>,
    ) -> Result<Conversation> {
        if let Some(existing) = self.find_active_by_key(key)? {
            if existing.contact_name.is_none() && contact_name.is_some() {
                let now = now_millis();
                let db = self.db.lock().unwrap();
                db.execute(
                    "UPDATE conversations SET contact_name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![contact_name, now, existing.id],
                )?;
                drop(db);
                let updated = self.get_conversation(&existing.id)?;
                self.changes.publish(ChangeRecord::ConversationUpdated {
                    conversation: updated.clone(),
                });
                return Ok(updated);
            }
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let display =
            normalize_display_number(display_number.unwrap_or(key.remote_phone.as_str()));

        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            let ticket = next_ticket(&tx)?;
            tx.execute(
                "INSERT INTO conversations
                 (id, channel, channel_connection_id, remote_phone, display_number, contact_name,
                  status, ticket_number, created_at, updated_at)
                 VALUES (?1, 'whatsapp', ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7)",
                params![
                    id,
                    key.channel_connection_id,
                    key.remote_phone,
                    display,
                    contact_name,
                    ticket,
                    now
                ],
            )?;
            tx.commit()?;
        }

        let conversation = self.get_conversation(&id)?;
        info!(conversation_id = %id, ticket = conversation.ticket_number, key = %key, "conversation created");
        self.changes.publish(ChangeRecord::ConversationUpdated {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    // ── Messages ────────────────────────────────────────────────────────

    pub fn message_exists(&self, provider_message_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE provider_message_id = ?1",
            params![provider_message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Append a message and refresh the conversation preview. A duplicate
    /// `provider_message_id` returns the already-stored row unchanged.
    pub fn append_message(&self, conversation_id: &str, new: NewMessage) -> Result<Message> {
        if let Some(pid) = &new.provider_message_id {
            let db = self.db.lock().unwrap();
            let existing = db
                .query_row(
                    &format!("SELECT {MSG_COLS} FROM messages WHERE provider_message_id = ?1"),
                    params![pid],
                    row_to_message,
                )
                .optional()?;
            if let Some(msg) = existing {
                return Ok(msg);
            }
        }

        let direction = new.direction.unwrap_or(Direction::In);
        let msg_type = new.msg_type.unwrap_or(MessageType::Text);
        let status = new.status.unwrap_or(match direction {
            Direction::In => MessageStatus::Sent,
            Direction::Out => MessageStatus::Pending,
        });
        let id = Uuid::now_v7().to_string();
        let now = now_millis();
        let metadata_json = new
            .provider_metadata
            .as_ref()
            .map(|v| v.to_string());
        let preview: String = match &new.text {
            Some(t) => t.chars().take(PREVIEW_MAX).collect(),
            None => format!("[{}]", msg_type.as_str()),
        };
        // An advisor reply resets the queue-timeout escalation ladder.
        let advisor_reply = direction == Direction::Out
            && msg_type != MessageType::Event
            && new
                .sent_by
                .as_deref()
                .is_some_and(|s| s != ASSIGNED_BOT);

        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO messages ({MSG_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    id,
                    conversation_id,
                    direction.as_str(),
                    msg_type.as_str(),
                    new.text,
                    new.media_url,
                    new.media_thumb,
                    new.replied_to_id,
                    status.as_str(),
                    now,
                    new.event_type,
                    new.sent_by,
                    new.provider_message_id,
                    metadata_json,
                ],
            )?;
            let unread_bump = if direction == Direction::In { 1 } else { 0 };
            tx.execute(
                "UPDATE conversations
                 SET last_message_preview = ?1,
                     last_message_at = ?2,
                     unread = unread + ?3,
                     queue_timeout_level = CASE WHEN ?4 THEN 0 ELSE queue_timeout_level END,
                     updated_at = ?2
                 WHERE id = ?5",
                params![preview, now, unread_bump, advisor_reply, conversation_id],
            )?;
            tx.commit()?;
        }

        let message = self.get_message(&id)?;
        self.changes.publish(ChangeRecord::MessageNew {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        });
        let conversation = self.get_conversation(conversation_id)?;
        self.changes
            .publish(ChangeRecord::ConversationUpdated { conversation });
        Ok(message)
    }

    pub fn get_message(&self, id: &str) -> Result<Message> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {MSG_COLS} FROM messages WHERE id = ?1"),
            params![id],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: "message",
            id: id.to_string(),
        })
    }

    pub fn get_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MSG_COLS} FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let mut rows: Vec<Message> = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// Apply a delivery-status update from the provider. Illegal (late or
    /// duplicate) transitions are ignored, the provider resends freely.
    pub fn mark_status_by_provider_id(
        &self,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<Option<Message>> {
        let current = {
            let db = self.db.lock().unwrap();
            db.query_row(
                &format!("SELECT {MSG_COLS} FROM messages WHERE provider_message_id = ?1"),
                params![provider_message_id],
                row_to_message,
            )
            .optional()?
        };
        let Some(message) = current else {
            warn!(provider_message_id, "status update for unknown message");
            return Ok(None);
        };
        if !message.status.can_advance(status) {
            return Ok(None);
        }

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                params![status.as_str(), message.id],
            )?;
        }
        self.changes.publish(ChangeRecord::MessageStatus {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            status,
        });
        Ok(Some(Message { status, ..message }))
    }

    /// Mark a pending/sent outbound as failed (send retries exhausted).
    pub fn mark_message_failed(&self, message_id: &str) -> Result<()> {
        let message = self.get_message(message_id)?;
        if !message.status.can_advance(MessageStatus::Failed) {
            return Ok(());
        }
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE messages SET status = 'failed' WHERE id = ?1",
                params![message_id],
            )?;
        }
        self.changes.publish(ChangeRecord::MessageStatus {
            conversation_id: message.conversation_id,
            message_id: message_id.to_string(),
            status: MessageStatus::Failed,
        });
        Ok(())
    }

    /// Record the provider message id once the provider acks a send, and
    /// advance pending → sent.
    pub fn confirm_sent(&self, message_id: &str, provider_message_id: &str) -> Result<()> {
        let message = self.get_message(message_id)?;
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE messages SET provider_message_id = ?1,
                        status = CASE WHEN status = 'pending' THEN 'sent' ELSE status END
                 WHERE id = ?2",
                params![provider_message_id, message_id],
            )?;
        }
        if message.status == MessageStatus::Pending {
            self.changes.publish(ChangeRecord::MessageStatus {
                conversation_id: message.conversation_id,
                message_id: message_id.to_string(),
                status: MessageStatus::Sent,
            });
        }
        Ok(())
    }

    // ── Ownership transitions ───────────────────────────────────────────

    /// Hand the conversation to the flow bot.
    pub fn start_bot(&self, conversation_id: &str, flow_id: &str) -> Result<Conversation> {
        let now = now_millis();
        {
            let db = self.db.lock().unwrap();
            let n = db.execute(
                "UPDATE conversations
                 SET assigned_to = ?1, bot_flow_id = ?2, bot_started_at = ?3,
                     assigned_at = NULL, queued_at = NULL, status = 'active', updated_at = ?3
                 WHERE id = ?4 AND status != 'closed'",
                params![ASSIGNED_BOT, flow_id, now, conversation_id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    what: "conversation",
                    id: conversation_id.to_string(),
                });
            }
        }
        self.emit_conversation(conversation_id)
    }

    /// Queue the conversation for human assignment.
    pub fn enqueue(&self, conversation_id: &str, queue_id: &str) -> Result<Conversation> {
        let now = now_millis();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE conversations
                 SET status = 'active', assigned_to = NULL, assigned_at = NULL,
                     queued_at = ?1, queue_id = ?2, updated_at = ?1
                 WHERE id = ?3 AND status != 'closed'",
                params![now, queue_id, conversation_id],
            )?;
        }
        self.emit_conversation(conversation_id)
    }

    /// Assign to an advisor. Compare-and-swap on `assigned_to IS NULL`:
    /// a concurrent claim loses with `Conflict` and must re-evaluate.
    pub fn assign(&self, conversation_id: &str, advisor_id: &str) -> Result<Conversation> {
        let now = now_millis();
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            let n = tx.execute(
                "UPDATE conversations
                 SET status = 'attending', assigned_to = ?1, assigned_at = ?2,
                     queued_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'active' AND assigned_to IS NULL",
                params![advisor_id, now, conversation_id],
            )?;
            if n == 0 {
                return Err(StoreError::Conflict(format!(
                    "conversation {conversation_id} is no longer assignable"
                )));
            }
            add_to_json_list(&tx, conversation_id, "attended_by", advisor_id)?;
            add_to_json_list(&tx, conversation_id, "active_advisors", advisor_id)?;
            tx.execute(
                "UPDATE advisors SET last_assignment_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, advisor_id],
            )?;
            tx.commit()?;
        }
        self.log_activity(advisor_id, "accept", &format!("{{\"conversation_id\":\"{conversation_id}\"}}"))?;
        self.emit_conversation(conversation_id)
    }

    /// Return the conversation to a queue, clearing any bot or advisor
    /// ownership. Deletes the bot session in the same transaction and
    /// appends a system event message.
    pub fn transfer_to_queue(
        &self,
        conversation_id: &str,
        queue_id: &str,
        queue_name: &str,
        reason: Option<&str>,
        from_advisor: Option<&str>,
    ) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id)?;
        let now = now_millis();
        let session_key =
            ConversationKey::new(&conversation.channel_connection_id, &conversation.remote_phone)
                .format();
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            tx.execute(
                "UPDATE conversations
                 SET status = 'active', assigned_to = NULL, assigned_at = NULL,
                     queued_at = ?1, queue_id = ?2,
                     bot_flow_id = NULL, bot_started_at = NULL,
                     transferred_from = ?3, transferred_at = ?1,
                     active_advisors = '[]', updated_at = ?1
                 WHERE id = ?4 AND status != 'closed'",
                params![now, queue_id, from_advisor, conversation_id],
            )?;
            tx.execute(
                "DELETE FROM bot_sessions WHERE session_key = ?1",
                params![session_key],
            )?;
            tx.commit()?;
        }

        let text = match reason {
            Some(r) if !r.is_empty() => {
                format!("Chat transferido a la cola {queue_name} — {r}")
            }
            _ => format!("Chat transferido a la cola {queue_name}"),
        };
        self.append_message(conversation_id, NewMessage::system_event("transfer", text))?;
        if let Some(advisor) = from_advisor {
            self.log_activity(advisor, "transfer", &format!("{{\"conversation_id\":\"{conversation_id}\",\"queue_id\":\"{queue_id}\"}}"))?;
        }
        self.emit_conversation(conversation_id)
    }

    /// Release an advisor's conversation back to its queue. Queue id is
    /// preserved; the dispatcher re-runs afterwards.
    pub fn release(
        &self,
        conversation_id: &str,
        advisor_id: &str,
        system_note: Option<&str>,
    ) -> Result<Conversation> {
        let now = now_millis();
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            let n = tx.execute(
                "UPDATE conversations
                 SET status = 'active', assigned_to = NULL, assigned_at = NULL,
                     queued_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND assigned_to = ?3",
                params![now, conversation_id, advisor_id],
            )?;
            if n == 0 {
                return Err(StoreError::Conflict(format!(
                    "conversation {conversation_id} is not held by {advisor_id}"
                )));
            }
            remove_from_json_list(&tx, conversation_id, "active_advisors", advisor_id)?;
            tx.commit()?;
        }
        if let Some(note) = system_note {
            self.append_message(conversation_id, NewMessage::system_event("release", note))?;
        }
        self.log_activity(advisor_id, "release", &format!("{{\"conversation_id\":\"{conversation_id}\"}}"))?;
        self.emit_conversation(conversation_id)
    }

    /// Close the conversation. The bot session dies in the same commit.
    pub fn close(&self, conversation_id: &str, closed_by: Option<&str>) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id)?;
        let now = now_millis();
        let session_key =
            ConversationKey::new(&conversation.channel_connection_id, &conversation.remote_phone)
                .format();
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            tx.execute(
                "UPDATE conversations
                 SET status = 'closed', assigned_to = NULL, assigned_at = NULL,
                     queued_at = NULL, bot_flow_id = NULL, bot_started_at = NULL,
                     active_advisors = '[]', updated_at = ?1
                 WHERE id = ?2",
                params![now, conversation_id],
            )?;
            tx.execute(
                "DELETE FROM bot_sessions WHERE session_key = ?1",
                params![session_key],
            )?;
            tx.commit()?;
        }
        if let Some(advisor) = closed_by {
            self.log_activity(advisor, "close", &format!("{{\"conversation_id\":\"{conversation_id}\"}}"))?;
        }
        self.emit_conversation(conversation_id)
    }

    /// Operator read marker: clears the unread counter.
    pub fn mark_read(&self, conversation_id: &str) -> Result<Conversation> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE conversations SET unread = 0, updated_at = ?1 WHERE id = ?2",
                params![now_millis(), conversation_id],
            )?;
        }
        self.emit_conversation(conversation_id)
    }

    /// Repair helper for the reconciliation pass: force both bot signals
    /// coherent. With a flow id, ownership is restored; without one, the
    /// bot claim is dropped entirely.
    pub fn force_bot_consistency(
        &self,
        conversation_id: &str,
        flow_id: Option<&str>,
    ) -> Result<Conversation> {
        let now = now_millis();
        {
            let db = self.db.lock().unwrap();
            match flow_id {
                Some(flow_id) => db.execute(
                    "UPDATE conversations
                     SET assigned_to = ?1, bot_flow_id = ?2,
                         bot_started_at = COALESCE(bot_started_at, ?3), updated_at = ?3
                     WHERE id = ?4",
                    params![ASSIGNED_BOT, flow_id, now, conversation_id],
                )?,
                None => db.execute(
                    "UPDATE conversations
                     SET assigned_to = CASE WHEN assigned_to = ?1 THEN NULL ELSE assigned_to END,
                         bot_flow_id = NULL, bot_started_at = NULL, updated_at = ?2
                     WHERE id = ?3",
                    params![ASSIGNED_BOT, now, conversation_id],
                )?,
            };
        }
        self.emit_conversation(conversation_id)
    }

    /// Bump the queue-timeout escalation level (scheduler only).
    pub fn bump_timeout_level(&self, conversation_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE conversations SET queue_timeout_level = queue_timeout_level + 1 WHERE id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    /// Whether the assigned advisor has sent anything (events excluded)
    /// since `since_ms`.
    pub fn advisor_replied_since(&self, conversation_id: &str, since_ms: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND direction = 'out' AND msg_type != 'event'
               AND sent_by IS NOT NULL AND sent_by != ?2 AND timestamp >= ?3",
            params![conversation_id, ASSIGNED_BOT, since_ms],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Attachments ─────────────────────────────────────────────────────

    pub fn link_attachment(
        &self,
        message_id: &str,
        kind: &str,
        url: &str,
        thumbnail: Option<&str>,
        filename: &str,
        mimetype: &str,
        size: i64,
    ) -> Result<Attachment> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO attachments (id, message_id, kind, url, thumbnail, filename, mimetype, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![id, message_id, kind, url, thumbnail, filename, mimetype, size, now],
        )?;
        Ok(Attachment {
            id,
            message_id: message_id.to_string(),
            kind: kind.to_string(),
            url: url.to_string(),
            thumbnail: thumbnail.map(str::to_string),
            filename: filename.to_string(),
            mimetype: mimetype.to_string(),
            size,
            created_at: now,
        })
    }

    pub fn get_attachments(&self, conversation_id: &str) -> Result<Vec<Attachment>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT a.id, a.message_id, a.kind, a.url, a.thumbnail, a.filename, a.mimetype,
                    a.size, a.created_at
             FROM attachments a
             JOIN messages m ON m.id = a.message_id
             WHERE m.conversation_id = ?1
             ORDER BY a.created_at",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(Attachment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                kind: row.get(2)?,
                url: row.get(3)?,
                thumbnail: row.get(4)?,
                filename: row.get(5)?,
                mimetype: row.get(6)?,
                size: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ── One-time alias migration ────────────────────────────────────────

    /// Rewrite legacy alias channel ids to provider phone-number-ids and
    /// merge the duplicates this uncovers: the most recently active
    /// conversation wins, all messages are reparented onto it, the rest
    /// are deleted. Returns the number of merged-away rows.
    pub fn merge_alias_duplicates(&self, aliases: &HashMap<String, String>) -> Result<usize> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        for (alias, canonical) in aliases {
            tx.execute(
                "UPDATE conversations SET channel_connection_id = ?1
                 WHERE channel_connection_id = ?2",
                params![canonical, alias],
            )?;
        }

        // Group non-closed duplicates per key.
        let groups: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT channel_connection_id, remote_phone FROM conversations
                 WHERE status != 'closed'
                 GROUP BY channel_connection_id, remote_phone
                 HAVING COUNT(*) > 1",
            )?;
            let rows: Vec<_> = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut merged = 0usize;
        for (conn_id, phone) in groups {
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM conversations
                     WHERE channel_connection_id = ?1 AND remote_phone = ?2 AND status != 'closed'
                     ORDER BY COALESCE(last_message_at, created_at) DESC",
                )?;
                let rows: Vec<_> = stmt
                    .query_map(params![conn_id, phone], |row| row.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };
            let Some((winner, losers)) = ids.split_first() else {
                continue;
            };
            for loser in losers {
                tx.execute(
                    "UPDATE messages SET conversation_id = ?1 WHERE conversation_id = ?2",
                    params![winner, loser],
                )?;
                tx.execute("DELETE FROM conversations WHERE id = ?1", params![loser])?;
                merged += 1;
            }
        }

        tx.commit()?;
        if merged > 0 {
            info!(merged, "alias duplicate conversations merged");
        }
        Ok(merged)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn emit_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id)?;
        self.changes.publish(ChangeRecord::ConversationUpdated {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }
}

/// Bump and read the monotonic ticket counter inside the caller's
/// transaction.
fn next_ticket(conn: &Connection) -> Result<i64> {
    conn.execute("UPDATE counters SET value = value + 1 WHERE name = 'ticket'", [])?;
    Ok(conn.query_row(
        "SELECT value FROM counters WHERE name = 'ticket'",
        [],
        |row| row.get(0),
    )?)
}

fn add_to_json_list(
    conn: &Connection,
    conversation_id: &str,
    column: &str,
    value: &str,
) -> Result<()> {
    mutate_json_list(conn, conversation_id, column, |list| {
        if !list.iter().any(|v| v == value) {
            list.push(value.to_string());
        }
    })
}

fn remove_from_json_list(
    conn: &Connection,
    conversation_id: &str,
    column: &str,
    value: &str,
) -> Result<()> {
    mutate_json_list(conn, conversation_id, column, |list| {
        list.retain(|v| v != value);
    })
}

fn mutate_json_list(
    conn: &Connection,
    conversation_id: &str,
    column: &str,
    f: impl FnOnce(&mut Vec<String>),
) -> Result<()> {
    // column is a compile-time constant at every call site.
    let current: String = conn.query_row(
        &format!("SELECT {column} FROM conversations WHERE id = ?1"),
        params![conversation_id],
        |row| row.get(0),
    )?;
    let mut list: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
    f(&mut list);
    conn.execute(
        &format!("UPDATE conversations SET {column} = ?1 WHERE id = ?2"),
        params![serde_json::to_string(&list)?, conversation_id],
    )?;
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    use std::str::FromStr;
    let status =
        ConversationStatus::from_str(&row.get::<_, String>(6)?).unwrap_or(ConversationStatus::Active);
    let attended_by: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(14)?).unwrap_or_default();
    let active_advisors: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(15)?).unwrap_or_default();
    Ok(Conversation {
        id: row.get(0)?,
        channel: row.get(1)?,
        channel_connection_id: row.get(2)?,
        remote_phone: row.get(3)?,
        display_number: row.get(4)?,
        contact_name: row.get(5)?,
        status,
        assigned_to: row.get(7)?,
        assigned_at: row.get(8)?,
        queued_at: row.get(9)?,
        queue_id: row.get(10)?,
        bot_flow_id: row.get(11)?,
        bot_started_at: row.get(12)?,
        ticket_number: row.get(13)?,
        attended_by,
        active_advisors,
        transferred_from: row.get(16)?,
        transferred_at: row.get(17)?,
        queue_timeout_level: row.get(18)?,
        unread: row.get(19)?,
        last_message_preview: row.get(20)?,
        last_message_at: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let direction = Direction::parse(&row.get::<_, String>(2)?).unwrap_or(Direction::In);
    let msg_type = MessageType::parse(&row.get::<_, String>(3)?).unwrap_or(MessageType::Text);
    let status = MessageStatus::parse(&row.get::<_, String>(8)?).unwrap_or(MessageStatus::Pending);
    let metadata = row
        .get::<_, Option<String>>(13)?
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction,
        msg_type,
        text: row.get(4)?,
        media_url: row.get(5)?,
        media_thumb: row.get(6)?,
        replied_to_id: row.get(7)?,
        status,
        timestamp: row.get(9)?,
        event_type: row.get(10)?,
        sent_by: row.get(11)?,
        provider_message_id: row.get(12)?,
        provider_metadata: metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn key() -> ConversationKey {
        ConversationKey::new("104858275551234", "51999000001")
    }

    #[test]
    fn upsert_creates_once_and_assigns_tickets_monotonically() {
        let s = store();
        let a = s.upsert_on_inbound(&key(), Some("+51 999 000 001"), Some("Ana")).unwrap();
        let b = s.upsert_on_inbound(&key(), None, None).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.display_number, "+51999000001");
        assert_eq!(a.ticket_number, 1);

        let other = ConversationKey::new("104858275551234", "51999000002");
        let c = s.upsert_on_inbound(&other, None, None).unwrap();
        assert_eq!(c.ticket_number, 2);
    }

    #[test]
    fn one_active_conversation_per_key() {
        let s = store();
        let a = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.close(&a.id, None).unwrap();
        let b = s.upsert_on_inbound(&key(), None, None).unwrap();
        assert_ne!(a.id, b.id);
        // Only the new one is active.
        assert_eq!(s.find_active_by_key(&key()).unwrap().unwrap().id, b.id);
    }

    #[test]
    fn duplicate_provider_message_id_is_ignored() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        let m1 = s
            .append_message(&conv.id, NewMessage::inbound_text("hola", "wamid.1"))
            .unwrap();
        let m2 = s
            .append_message(&conv.id, NewMessage::inbound_text("hola", "wamid.1"))
            .unwrap();
        assert_eq!(m1.id, m2.id);
        assert_eq!(s.get_messages(&conv.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn inbound_bumps_unread_and_preview() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.append_message(&conv.id, NewMessage::inbound_text("necesito ayuda", "wamid.2"))
            .unwrap();
        let conv = s.get_conversation(&conv.id).unwrap();
        assert_eq!(conv.unread, 1);
        assert_eq!(conv.last_message_preview.as_deref(), Some("necesito ayuda"));
        assert!(conv.last_message_at.is_some());
    }

    #[test]
    fn status_updates_are_monotone() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        let msg = s
            .append_message(&conv.id, NewMessage::outbound_text("Hola", "bot"))
            .unwrap();
        s.confirm_sent(&msg.id, "wamid.out1").unwrap();

        let updated = s
            .mark_status_by_provider_id("wamid.out1", MessageStatus::Read)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Read);
        // Late "delivered" after read is ignored.
        assert!(s
            .mark_status_by_provider_id("wamid.out1", MessageStatus::Delivered)
            .unwrap()
            .is_none());
    }

    #[test]
    fn assign_is_compare_and_swap() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        seed_advisor(&s, "adv-1");
        seed_advisor(&s, "adv-2");
        s.enqueue(&conv.id, "q-ventas").unwrap();

        let assigned = s.assign(&conv.id, "adv-1").unwrap();
        assert_eq!(assigned.status, ConversationStatus::Attending);
        assert_eq!(assigned.assigned_to.as_deref(), Some("adv-1"));
        assert!(assigned.queued_at.is_none());
        assert!(assigned.attended_by.contains(&"adv-1".to_string()));

        // Second claim loses.
        assert!(matches!(
            s.assign(&conv.id, "adv-2"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn transfer_clears_bot_ownership_and_appends_event() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.start_bot(&conv.id, "flow-1").unwrap();
        assert_eq!(s.count_bot_divergent().unwrap(), 0);

        let after = s
            .transfer_to_queue(&conv.id, "q-support", "Soporte", Some("timeout"), None)
            .unwrap();
        assert_eq!(after.status, ConversationStatus::Active);
        assert!(after.assigned_to.is_none());
        assert!(after.bot_flow_id.is_none());
        assert!(after.bot_started_at.is_none());
        assert_eq!(after.queue_id.as_deref(), Some("q-support"));
        assert!(after.queued_at.is_some());

        let msgs = s.get_messages(&conv.id, 10).unwrap();
        let event = msgs.last().unwrap();
        assert_eq!(event.msg_type, MessageType::Event);
        assert!(event.text.as_deref().unwrap().contains("Soporte"));
    }

    #[test]
    fn release_preserves_queue() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        seed_advisor(&s, "adv-1");
        s.enqueue(&conv.id, "q-ventas").unwrap();
        s.assign(&conv.id, "adv-1").unwrap();

        let after = s
            .release(&conv.id, "adv-1", Some("👋 Ana cerró sesión (1 chat devuelto)"))
            .unwrap();
        assert_eq!(after.status, ConversationStatus::Active);
        assert!(after.assigned_to.is_none());
        assert_eq!(after.queue_id.as_deref(), Some("q-ventas"));
        assert!(after.active_advisors.is_empty());
    }

    #[test]
    fn close_deletes_bot_session_in_same_commit() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        let session_key = key().format();
        {
            let db = s.db.lock().unwrap();
            db.execute(
                "INSERT INTO bot_sessions (session_key, flow_id, current_node_id, created_at, last_activity_at)
                 VALUES (?1, 'flow-1', 'n-start', 0, 0)",
                params![session_key],
            )
            .unwrap();
        }
        s.close(&conv.id, None).unwrap();
        let db = s.db.lock().unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM bot_sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn advisor_reply_resets_timeout_level() {
        let s = store();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.bump_timeout_level(&conv.id).unwrap();
        assert_eq!(s.get_conversation(&conv.id).unwrap().queue_timeout_level, 1);
        s.append_message(&conv.id, NewMessage::outbound_text("¿En qué ayudo?", "adv-1"))
            .unwrap();
        assert_eq!(s.get_conversation(&conv.id).unwrap().queue_timeout_level, 0);
    }

    #[test]
    fn merge_alias_duplicates_reparents_messages() {
        let s = store();
        // Legacy conversation under an alias UUID.
        let legacy_key = ConversationKey::new("alias-uuid-1", "51999000001");
        let legacy = s.upsert_on_inbound(&legacy_key, None, None).unwrap();
        s.append_message(&legacy.id, NewMessage::inbound_text("viejo", "wamid.old"))
            .unwrap();
        // Canonical conversation, more recent.
        let canonical = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.append_message(&canonical.id, NewMessage::inbound_text("nuevo", "wamid.new"))
            .unwrap();

        let mut aliases = HashMap::new();
        aliases.insert("alias-uuid-1".to_string(), "104858275551234".to_string());
        let merged = s.merge_alias_duplicates(&aliases).unwrap();
        assert_eq!(merged, 1);

        let survivor = s.find_active_by_key(&key()).unwrap().unwrap();
        assert_eq!(survivor.id, canonical.id);
        assert_eq!(s.get_messages(&survivor.id, 10).unwrap().len(), 2);
    }

    #[test]
    fn change_records_follow_mutation_order() {
        let s = store();
        let mut rx = s.changes().subscribe();
        let conv = s.upsert_on_inbound(&key(), None, None).unwrap();
        s.append_message(&conv.id, NewMessage::outbound_text("m1", "bot")).unwrap();
        s.append_message(&conv.id, NewMessage::outbound_text("m2", "bot")).unwrap();

        // created, m1, conv, m2, conv, message events in authorship order.
        let mut message_texts = Vec::new();
        while let Ok(rec) = rx.try_recv() {
            if let ChangeRecord::MessageNew { message, .. } = rec {
                message_texts.push(message.text.unwrap());
            }
        }
        assert_eq!(message_texts, vec!["m1".to_string(), "m2".to_string()]);
    }

    fn seed_advisor(s: &Store, id: &str) {
        let db = s.db.lock().unwrap();
        db.execute(
            "INSERT INTO advisors (id, username, display_name, password_hash, created_at, updated_at)
             VALUES (?1, ?1, ?1, 'x', 0, 0)",
            params![id],
        )
        .unwrap();
    }
}
