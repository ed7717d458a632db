//! Operator-facing queue operations: accept, transfer, release, and the
//! release-everything path on logout. The schedulers reuse these so
//! time-sourced mutations look exactly like operator ones.

use std::sync::Arc;

use chasqui_store::Store;
use tracing::info;

use crate::dispatcher::{QueueHandle, QueueTrigger};
use crate::eligibility::ineligibility_reason;
use crate::error::{QueueError, Result};

pub struct QueueEngine {
    store: Arc<Store>,
    handle: QueueHandle,
}

impl QueueEngine {
    pub fn new(store: Arc<Store>, handle: QueueHandle) -> Self {
        Self { store, handle }
    }

    pub fn handle(&self) -> &QueueHandle {
        &self.handle
    }

    /// Explicit operator accept. Subject to the same CAS as the
    /// dispatcher; capacity and status rules apply to operators too.
    pub async fn accept(&self, conversation_id: &str, advisor_id: &str) -> Result<()> {
        if let Some(reason) = ineligibility_reason(&self.store, advisor_id)? {
            return Err(QueueError::NotEligible {
                advisor_id: advisor_id.to_string(),
                reason,
            });
        }
        let _guard = self.store.lock_conversation(conversation_id).await;
        self.store.assign(conversation_id, advisor_id)?;
        Ok(())
    }

    pub async fn transfer_to_queue(
        &self,
        conversation_id: &str,
        queue_id: &str,
        reason: Option<&str>,
        from_advisor: Option<&str>,
    ) -> Result<()> {
        {
            let _guard = self.store.lock_conversation(conversation_id).await;
            self.transfer_to_queue_locked(conversation_id, queue_id, reason, from_advisor)?;
        }
        Ok(())
    }

    /// Transfer variant for callers that already hold the conversation
    /// lock (the flow engine mid-macro-step, agent tools). The
    /// conversation lock is NOT reentrant; taking it twice would deadlock
    /// the task.
    pub fn transfer_to_queue_locked(
        &self,
        conversation_id: &str,
        queue_id: &str,
        reason: Option<&str>,
        from_advisor: Option<&str>,
    ) -> Result<()> {
        let queue = self.store.get_queue(queue_id)?;
        self.store.transfer_to_queue(
            conversation_id,
            queue_id,
            &queue.name,
            reason,
            from_advisor,
        )?;
        self.handle.trigger(QueueTrigger::ChatQueued {
            queue_id: queue_id.to_string(),
        });
        if let Some(advisor) = from_advisor {
            self.handle.trigger(QueueTrigger::AdvisorCapacityFreed {
                advisor_id: advisor.to_string(),
            });
        }
        Ok(())
    }

    /// Direct advisor-to-advisor transfer. Assigns immediately when the
    /// target can take the chat; otherwise the chat queues normally.
    pub async fn transfer_to_advisor(
        &self,
        conversation_id: &str,
        target_advisor: &str,
        from_advisor: &str,
    ) -> Result<()> {
        let target_ok = ineligibility_reason(&self.store, target_advisor)?.is_none();
        if !target_ok {
            let conversation = self.store.get_conversation(conversation_id)?;
            let queue_id = conversation
                .queue_id
                .clone()
                .ok_or_else(|| QueueError::NotEligible {
                    advisor_id: target_advisor.to_string(),
                    reason: "target unavailable and conversation has no queue".into(),
                })?;
            return self
                .transfer_to_queue(conversation_id, &queue_id, Some("transferencia directa"), Some(from_advisor))
                .await;
        }

        {
            let _guard = self.store.lock_conversation(conversation_id).await;
            self.store.release(conversation_id, from_advisor, None)?;
            self.store.assign(conversation_id, target_advisor)?;
            let target = self.store.get_advisor(target_advisor)?;
            self.store.append_message(
                conversation_id,
                chasqui_store::types::NewMessage::system_event(
                    "transfer",
                    format!("Chat transferido a {}", target.display_name),
                ),
            )?;
        }
        self.handle.trigger(QueueTrigger::AdvisorCapacityFreed {
            advisor_id: from_advisor.to_string(),
        });
        info!(conversation_id, from_advisor, target_advisor, "direct transfer");
        Ok(())
    }

    /// Return a chat to its queue.
    pub async fn release(&self, conversation_id: &str, advisor_id: &str) -> Result<()> {
        let queue_id = {
            let _guard = self.store.lock_conversation(conversation_id).await;
            self.store.release(conversation_id, advisor_id, None)?.queue_id
        };
        if let Some(queue_id) = queue_id {
            self.handle
                .trigger(QueueTrigger::ConversationReleased { queue_id });
        }
        self.handle.trigger(QueueTrigger::AdvisorCapacityFreed {
            advisor_id: advisor_id.to_string(),
        });
        Ok(())
    }

    /// Logout: close the advisor's sessions and return every held chat to
    /// its queue with a goodbye system message, then re-dispatch.
    pub async fn logout_release(&self, advisor_id: &str) -> Result<Vec<String>> {
        let advisor = self.store.get_advisor(advisor_id)?;
        self.store.end_advisor_sessions(advisor_id)?;

        let held = self.store.list_conversations(&chasqui_store::conversations::ConversationFilter {
            assigned_to: Some(advisor_id.to_string()),
            status: Some(chasqui_store::types::ConversationStatus::Attending),
            ..Default::default()
        })?;

        let total = held.len();
        let note = format!(
            "👋 {} cerró sesión ({} {} devueltos a la cola)",
            advisor.display_name,
            total,
            if total == 1 { "chat" } else { "chats" }
        );

        let mut released = Vec::with_capacity(total);
        for chat in held {
            let _guard = self.store.lock_conversation(&chat.id).await;
            self.store.release(&chat.id, advisor_id, Some(&note))?;
            released.push(chat.id.clone());
            drop(_guard);
            if let Some(queue_id) = chat.queue_id {
                self.handle
                    .trigger(QueueTrigger::ConversationReleased { queue_id });
            }
        }
        info!(advisor_id, released = released.len(), "logout release");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use chasqui_core::types::ConversationKey;
    use chasqui_store::advisors::AdvisorRole;
    use chasqui_store::queues::DistributionMode;
    use chasqui_store::types::{ConversationStatus, MessageType};

    fn engine() -> (Arc<Store>, QueueEngine) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (_dispatcher, handle) = Dispatcher::new(store.clone());
        let engine = QueueEngine::new(store.clone(), handle);
        (store, engine)
    }

    fn online_advisor(store: &Store, username: &str) -> String {
        let advisor = store
            .create_advisor(username, username, AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        store.start_advisor_session(&advisor.id).unwrap();
        advisor.id
    }

    fn chat_in(store: &Store, queue_id: &str, phone: &str) -> String {
        let conv = store
            .upsert_on_inbound(&ConversationKey::new("104", phone), None, None)
            .unwrap();
        store.enqueue(&conv.id, queue_id).unwrap();
        conv.id
    }

    #[tokio::test]
    async fn accept_enforces_eligibility() {
        let (store, engine) = engine();
        let q = store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let ana = online_advisor(&store, "ana");
        store.add_queue_member(&q.id, &ana, false).unwrap();
        let chat = chat_in(&store, &q.id, "1");

        engine.accept(&chat, &ana).await.unwrap();
        assert_eq!(
            store.get_conversation(&chat).unwrap().status,
            ConversationStatus::Attending
        );

        // An offline advisor cannot accept.
        let beto = store
            .create_advisor("beto", "Beto", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        store.add_queue_member(&q.id, &beto.id, false).unwrap();
        let chat2 = chat_in(&store, &q.id, "2");
        assert!(matches!(
            engine.accept(&chat2, &beto.id).await,
            Err(QueueError::NotEligible { .. })
        ));
    }

    #[tokio::test]
    async fn logout_releases_all_held_chats_with_messages() {
        let (store, engine) = engine();
        let q = store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let ana = online_advisor(&store, "ana");
        store.add_queue_member(&q.id, &ana, false).unwrap();

        let x = chat_in(&store, &q.id, "x");
        let y = chat_in(&store, &q.id, "y");
        engine.accept(&x, &ana).await.unwrap();
        engine.accept(&y, &ana).await.unwrap();

        let released = engine.logout_release(&ana).await.unwrap();
        assert_eq!(released.len(), 2);
        assert!(!store.is_online(&ana).unwrap());

        for id in [&x, &y] {
            let conv = store.get_conversation(id).unwrap();
            assert_eq!(conv.status, ConversationStatus::Active);
            assert!(conv.assigned_to.is_none());
            assert_eq!(conv.queue_id.as_deref(), Some(q.id.as_str()));

            let msgs = store.get_messages(id, 10).unwrap();
            let event = msgs
                .iter()
                .rev()
                .find(|m| m.msg_type == MessageType::Event)
                .unwrap();
            assert!(event.text.as_deref().unwrap().starts_with("👋 ana cerró sesión ("));
        }
    }

    #[tokio::test]
    async fn direct_transfer_assigns_eligible_target() {
        let (store, engine) = engine();
        let q = store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let ana = online_advisor(&store, "ana");
        let beto = online_advisor(&store, "beto");
        store.add_queue_member(&q.id, &ana, false).unwrap();
        store.add_queue_member(&q.id, &beto, false).unwrap();

        let chat = chat_in(&store, &q.id, "1");
        engine.accept(&chat, &ana).await.unwrap();
        engine.transfer_to_advisor(&chat, &beto, &ana).await.unwrap();

        let conv = store.get_conversation(&chat).unwrap();
        assert_eq!(conv.assigned_to.as_deref(), Some(beto.as_str()));
        assert_eq!(conv.status, ConversationStatus::Attending);
    }

    #[tokio::test]
    async fn direct_transfer_to_unavailable_target_queues_instead() {
        let (store, engine) = engine();
        let q = store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let ana = online_advisor(&store, "ana");
        store.add_queue_member(&q.id, &ana, false).unwrap();
        // beto exists but never logs in
        let beto = store
            .create_advisor("beto", "Beto", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        store.add_queue_member(&q.id, &beto.id, false).unwrap();

        let chat = chat_in(&store, &q.id, "1");
        engine.accept(&chat, &ana).await.unwrap();
        engine.transfer_to_advisor(&chat, &beto.id, &ana).await.unwrap();

        let conv = store.get_conversation(&chat).unwrap();
        assert!(conv.assigned_to.is_none());
        assert_eq!(conv.queue_id.as_deref(), Some(q.id.as_str()));
        assert!(conv.queued_at.is_some());
    }
}
