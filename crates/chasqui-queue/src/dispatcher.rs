//! The event-driven dispatcher: consumes triggers, re-evaluates the
//! affected queues, assigns pending chats.

use std::sync::Arc;

use chasqui_store::{Store, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::eligibility::eligible_members;
use crate::error::Result;
use crate::select::select_advisor;

const TRIGGER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum QueueTrigger {
    ChatQueued { queue_id: String },
    AdvisorOnline { advisor_id: String },
    AdvisorStatusChanged { advisor_id: String },
    ConversationReleased { queue_id: String },
    AdvisorCapacityFreed { advisor_id: String },
}

/// Cheap cloneable handle for pushing triggers from anywhere (operator
/// handlers, schedulers, the flow engine's transfer node).
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueTrigger>,
}

impl QueueHandle {
    /// Non-blocking: a full trigger queue drops the event, the next
    /// trigger or scheduler tick re-evaluates anyway.
    pub fn trigger(&self, trigger: QueueTrigger) {
        if self.tx.try_send(trigger).is_err() {
            warn!("dispatcher trigger queue full, dropping trigger");
        }
    }
}

pub struct Dispatcher {
    store: Arc<Store>,
    rx: mpsc::Receiver<QueueTrigger>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE_CAPACITY);
        (Self { store, rx }, QueueHandle { tx })
    }

    /// Main loop. Runs until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("queue dispatcher started");
        loop {
            tokio::select! {
                trigger = self.rx.recv() => {
                    match trigger {
                        Some(trigger) => {
                            if let Err(e) = self.handle_trigger(trigger).await {
                                warn!("dispatch error: {e}");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_trigger(&self, trigger: QueueTrigger) -> Result<()> {
        debug!(?trigger, "dispatcher trigger");
        let queue_ids: Vec<String> = match &trigger {
            QueueTrigger::ChatQueued { queue_id }
            | QueueTrigger::ConversationReleased { queue_id } => vec![queue_id.clone()],
            QueueTrigger::AdvisorOnline { advisor_id }
            | QueueTrigger::AdvisorStatusChanged { advisor_id }
            | QueueTrigger::AdvisorCapacityFreed { advisor_id } => self
                .store
                .queues_for_advisor(advisor_id)?
                .into_iter()
                .map(|q| q.id)
                .collect(),
        };

        for queue_id in queue_ids {
            self.evaluate_queue(&queue_id).await?;
        }
        Ok(())
    }

    /// Assign as many pending chats in the queue as eligibility allows.
    /// Eligibility is re-read per chat because each assignment consumes
    /// capacity.
    pub async fn evaluate_queue(&self, queue_id: &str) -> Result<()> {
        let queue = self.store.get_queue(queue_id)?;

        for chat in self.store.list_queued(queue_id)? {
            let eligible = eligible_members(&self.store, queue_id)?;
            let Some(advisor_id) = select_advisor(&self.store, &queue, &eligible)? else {
                // manual queue, or nobody can take chats right now
                break;
            };

            let _guard = self.store.lock_conversation(&chat.id).await;
            match self.store.assign(&chat.id, &advisor_id) {
                Ok(assigned) => {
                    info!(
                        conversation_id = %chat.id,
                        advisor_id = %advisor_id,
                        queue_id,
                        ticket = assigned.ticket_number,
                        "chat assigned"
                    );
                }
                // Lost the CAS (operator accepted it first, or the chat
                // left the queue), move on.
                Err(StoreError::Conflict(_)) => {
                    debug!(conversation_id = %chat.id, "assignment raced, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chasqui_core::types::ConversationKey;
    use chasqui_store::advisors::AdvisorRole;
    use chasqui_store::queues::DistributionMode;
    use chasqui_store::types::ConversationStatus;

    fn seeded_store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    fn online_advisor(store: &Store, username: &str) -> String {
        let advisor = store
            .create_advisor(username, username, AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        store.start_advisor_session(&advisor.id).unwrap();
        advisor.id
    }

    fn queued_chat(store: &Store, queue_id: &str, phone: &str) -> String {
        let key = ConversationKey::new("104", phone);
        let conv = store.upsert_on_inbound(&key, None, None).unwrap();
        store.enqueue(&conv.id, queue_id).unwrap();
        conv.id
    }

    #[tokio::test]
    async fn least_busy_prefers_least_loaded() {
        let store = seeded_store();
        let q = store
            .create_queue("Ventas", DistributionMode::LeastBusy, 5)
            .unwrap();
        let a = online_advisor(&store, "ana");
        let b = online_advisor(&store, "beto");
        let c = online_advisor(&store, "carla");
        for advisor in [&a, &b, &c] {
            store.add_queue_member(&q.id, advisor, false).unwrap();
        }
        // Pre-load: B has 1 attending, C has 2.
        for (advisor, n) in [(&b, 1), (&c, 2)] {
            for i in 0..n {
                let id = queued_chat(&store, &q.id, &format!("pre-{advisor}-{i}"));
                store.assign(&id, advisor).unwrap();
            }
        }

        let (dispatcher, _handle) = Dispatcher::new(store.clone());

        // First chat → A (0 attending).
        let chat1 = queued_chat(&store, &q.id, "51999000001");
        dispatcher.evaluate_queue(&q.id).await.unwrap();
        assert_eq!(
            store.get_conversation(&chat1).unwrap().assigned_to.as_deref(),
            Some(a.as_str())
        );

        // Second chat → A and B tie at 1; B's assignment is older.
        let chat2 = queued_chat(&store, &q.id, "51999000002");
        dispatcher.evaluate_queue(&q.id).await.unwrap();
        assert_eq!(
            store.get_conversation(&chat2).unwrap().assigned_to.as_deref(),
            Some(b.as_str())
        );

        // Third chat → A (1) vs B (2) vs C (2): A again.
        let chat3 = queued_chat(&store, &q.id, "51999000003");
        dispatcher.evaluate_queue(&q.id).await.unwrap();
        assert_eq!(
            store.get_conversation(&chat3).unwrap().assigned_to.as_deref(),
            Some(a.as_str())
        );
    }

    #[tokio::test]
    async fn round_robin_rotates_and_persists_cursor() {
        let store = seeded_store();
        let q = store
            .create_queue("Soporte", DistributionMode::RoundRobin, 5)
            .unwrap();
        let a = online_advisor(&store, "ana");
        let b = online_advisor(&store, "beto");
        store.add_queue_member(&q.id, &a, false).unwrap();
        store.add_queue_member(&q.id, &b, false).unwrap();

        let (dispatcher, _handle) = Dispatcher::new(store.clone());
        let mut assignees = Vec::new();
        for i in 0..4 {
            let chat = queued_chat(&store, &q.id, &format!("5199900{i}"));
            dispatcher.evaluate_queue(&q.id).await.unwrap();
            assignees.push(store.get_conversation(&chat).unwrap().assigned_to.unwrap());
        }
        // Strict alternation between the two advisors.
        assert_ne!(assignees[0], assignees[1]);
        assert_eq!(assignees[0], assignees[2]);
        assert_eq!(assignees[1], assignees[3]);
    }

    #[tokio::test]
    async fn manual_queues_never_auto_assign() {
        let store = seeded_store();
        let q = store.create_queue("VIP", DistributionMode::Manual, 5).unwrap();
        let a = online_advisor(&store, "ana");
        store.add_queue_member(&q.id, &a, false).unwrap();
        let chat = queued_chat(&store, &q.id, "51999000001");

        let (dispatcher, _handle) = Dispatcher::new(store.clone());
        dispatcher.evaluate_queue(&q.id).await.unwrap();
        let conv = store.get_conversation(&chat).unwrap();
        assert!(conv.assigned_to.is_none());
        assert_eq!(conv.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let store = seeded_store();
        let q = store
            .create_queue("Ventas", DistributionMode::RoundRobin, 1)
            .unwrap();
        let a = online_advisor(&store, "ana");
        store.add_queue_member(&q.id, &a, false).unwrap();

        let chat1 = queued_chat(&store, &q.id, "1");
        let chat2 = queued_chat(&store, &q.id, "2");

        let (dispatcher, _handle) = Dispatcher::new(store.clone());
        dispatcher.evaluate_queue(&q.id).await.unwrap();

        let assigned: Vec<bool> = [&chat1, &chat2]
            .iter()
            .map(|id| store.get_conversation(id).unwrap().assigned_to.is_some())
            .collect();
        // max_concurrent = 1 → exactly one of the two got assigned.
        assert_eq!(assigned.iter().filter(|x| **x).count(), 1);
    }

    #[tokio::test]
    async fn offline_advisors_are_skipped() {
        let store = seeded_store();
        let q = store
            .create_queue("Ventas", DistributionMode::RoundRobin, 5)
            .unwrap();
        let advisor = store
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        store.add_queue_member(&q.id, &advisor.id, false).unwrap();
        // never logged in
        let chat = queued_chat(&store, &q.id, "1");

        let (dispatcher, _handle) = Dispatcher::new(store.clone());
        dispatcher.evaluate_queue(&q.id).await.unwrap();
        assert!(store.get_conversation(&chat).unwrap().assigned_to.is_none());
    }
}
