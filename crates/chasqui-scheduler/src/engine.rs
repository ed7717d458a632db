//! The 60-second reconciliation loop.

use std::sync::Arc;

use chasqui_core::config::SCHEDULER_TICK_SECS;
use chasqui_core::types::{now_millis, ConversationKey, ASSIGNED_BOT};
use chasqui_flows::{FlowCatalog, FlowError};
use chasqui_queue::{QueueEngine, QueueTrigger};
use chasqui_sessions::SessionStore;
use chasqui_store::types::ConversationStatus;
use chasqui_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Escalating inactivity thresholds for attending conversations, minutes.
/// A conversation's `queue_timeout_level` indexes into this ladder and
/// resets when the advisor replies.
pub const QUEUE_TIMEOUT_BUCKETS_MIN: [i64; 7] = [10, 30, 60, 120, 240, 480, 720];

const WAKE_QUEUE_CAPACITY: usize = 256;
/// Sessions idle longer than this with no owning signal are pruned.
const STALE_SESSION_HOURS: i64 = 72;

pub struct SchedulerEngine {
    store: Arc<Store>,
    sessions: Arc<SessionStore>,
    catalog: Arc<FlowCatalog>,
    queue: Arc<QueueEngine>,
    wake_tx: mpsc::Sender<ConversationKey>,
}

impl SchedulerEngine {
    /// Returns the engine and the receiver of durable delay wake-ups; the
    /// gateway forwards those to `FlowRuntime::resume_wakeup`.
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionStore>,
        catalog: Arc<FlowCatalog>,
        queue: Arc<QueueEngine>,
    ) -> (Self, mpsc::Receiver<ConversationKey>) {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE_CAPACITY);
        (
            Self {
                store,
                sessions,
                catalog,
                queue,
                wake_tx,
            },
            wake_rx,
        )
    }

    /// Main loop. Ticks every 60 s until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SCHEDULER_TICK_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(now_millis()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass. Each sub-pass is independent; a failure in one is
    /// logged and the others still run.
    pub async fn tick(&self, now_ms: i64) {
        if let Err(e) = self.bot_timeout_pass(now_ms).await {
            error!("bot-timeout pass failed: {e}");
        }
        if let Err(e) = self.queue_timeout_pass(now_ms).await {
            error!("queue-timeout pass failed: {e}");
        }
        if let Err(e) = self.cleanup_pass(now_ms).await {
            error!("cleanup pass failed: {e}");
        }
        // Invariant check: divergence surviving a full pass is a bug.
        match self.store.count_bot_divergent() {
            Ok(0) => {}
            Ok(n) => warn!(divergent = n, "bot ownership invariant violated after tick"),
            Err(e) => error!("invariant check failed: {e}"),
        }
    }

    /// Reconcile every bot-owned conversation: repair divergent flags,
    /// recover flow ids from the session, and transfer conversations whose
    /// per-flow timeout has elapsed. Idempotent, a transferred
    /// conversation stops being bot-owned.
    pub async fn bot_timeout_pass(&self, now_ms: i64) -> Result<usize> {
        let mut mutations = 0usize;

        for conversation in self.store.list_bot_owned()? {
            let _guard = self.store.lock_conversation(&conversation.id).await;
            // Re-read: an operator or the engine may have raced us.
            let conversation = match self.store.get_conversation(&conversation.id) {
                Ok(c) if c.is_bot_owned() && c.status != ConversationStatus::Closed => c,
                _ => continue,
            };

            let key = ConversationKey::new(
                conversation.channel_connection_id.clone(),
                conversation.remote_phone.clone(),
            );
            let session = self.sessions.get(&key)?;

            // Recovery: the conversation lost its flow id but the session
            // remembers it.
            let flow_id = conversation
                .bot_flow_id
                .clone()
                .or_else(|| session.as_ref().map(|s| s.flow_id.clone()));

            let Some(flow_id) = flow_id else {
                warn!(conversation_id = %conversation.id, "bot claim without flow or session, clearing");
                self.sessions.delete_if_exists(&key)?;
                self.store.force_bot_consistency(&conversation.id, None)?;
                mutations += 1;
                continue;
            };

            let flow = match self.catalog.get(&flow_id) {
                Ok(flow) => flow,
                Err(FlowError::NotFound { .. }) => {
                    warn!(conversation_id = %conversation.id, %flow_id, "bot flow no longer exists, clearing");
                    self.sessions.delete_if_exists(&key)?;
                    self.store.force_bot_consistency(&conversation.id, None)?;
                    mutations += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let started_at = conversation
                .bot_started_at
                .or(session.as_ref().map(|s| s.created_at))
                .unwrap_or(now_ms);
            let timeout_ms = (flow.bot_timeout_minutes as i64) * 60_000;

            if now_ms - started_at > timeout_ms {
                match &flow.fallback_queue_id {
                    Some(queue_id) => {
                        info!(
                            conversation_id = %conversation.id,
                            %flow_id,
                            queue_id,
                            "bot timeout, transferring to fallback queue"
                        );
                        self.queue.transfer_to_queue_locked(
                            &conversation.id,
                            queue_id,
                            Some("tiempo de espera del bot agotado"),
                            None,
                        )?;
                    }
                    None => {
                        info!(conversation_id = %conversation.id, %flow_id, "bot timeout, ending session");
                        self.sessions.delete_if_exists(&key)?;
                        self.store.force_bot_consistency(&conversation.id, None)?;
                    }
                }
                mutations += 1;
            } else if conversation.assigned_to.as_deref() != Some(ASSIGNED_BOT)
                || conversation.bot_flow_id.is_none()
                || conversation.bot_started_at.is_none()
            {
                // Not timed out, but the flags diverged, repair in place.
                debug!(conversation_id = %conversation.id, "repairing bot ownership flags");
                self.store
                    .force_bot_consistency(&conversation.id, Some(&flow_id))?;
                mutations += 1;
            }
        }

        Ok(mutations)
    }

    /// Return attending conversations whose advisor has gone quiet past
    /// the current escalation bucket. Returning resets `assigned_at`, so a
    /// re-run without a new boundary crossing changes nothing.
    pub async fn queue_timeout_pass(&self, now_ms: i64) -> Result<usize> {
        let mut mutations = 0usize;

        for conversation in self.store.list_attending()? {
            let (Some(assigned_at), Some(advisor_id)) =
                (conversation.assigned_at, conversation.assigned_to.clone())
            else {
                continue;
            };
            let level = (conversation.queue_timeout_level.max(0) as usize)
                .min(QUEUE_TIMEOUT_BUCKETS_MIN.len() - 1);
            let threshold_ms = QUEUE_TIMEOUT_BUCKETS_MIN[level] * 60_000;

            if now_ms - assigned_at <= threshold_ms {
                continue;
            }
            if self.store.advisor_replied_since(&conversation.id, assigned_at)? {
                continue;
            }

            let _guard = self.store.lock_conversation(&conversation.id).await;
            let current = match self.store.get_conversation(&conversation.id) {
                Ok(c) => c,
                Err(_) => continue,
            };
            // Somebody acted while we evaluated, skip this round.
            if current.status != ConversationStatus::Attending
                || current.assigned_to.as_deref() != Some(advisor_id.as_str())
                || current.assigned_at != Some(assigned_at)
            {
                continue;
            }
            let Some(queue_id) = current.queue_id.clone() else {
                continue;
            };

            info!(
                conversation_id = %conversation.id,
                advisor_id = %advisor_id,
                level,
                "advisor inactive past bucket, returning chat to queue"
            );
            self.store.bump_timeout_level(&conversation.id)?;
            self.store.release(
                &conversation.id,
                &advisor_id,
                Some("Chat devuelto a la cola por inactividad del asesor"),
            )?;
            drop(_guard);
            self.queue.handle().trigger(QueueTrigger::ConversationReleased {
                queue_id,
            });
            mutations += 1;
        }

        Ok(mutations)
    }

    /// Drop orphaned or long-stale sessions and surface due delay
    /// wake-ups (the durable half of the delay-node timer).
    pub async fn cleanup_pass(&self, now_ms: i64) -> Result<usize> {
        let mut mutations = 0usize;

        for key in self.sessions.list_keys()? {
            if self.store.find_active_by_key(&key)?.is_none() {
                debug!(key = %key, "dropping session without conversation");
                self.sessions.delete_if_exists(&key)?;
                mutations += 1;
            }
        }

        let stale_cutoff = now_ms - STALE_SESSION_HOURS * 3_600_000;
        for key in self.sessions.stale_keys(stale_cutoff)? {
            warn!(key = %key, "pruning stale session");
            self.sessions.delete_if_exists(&key)?;
            if let Some(conversation) = self.store.find_active_by_key(&key)? {
                self.store.force_bot_consistency(&conversation.id, None)?;
            }
            mutations += 1;
        }

        for key in self.sessions.due_wakeups(now_ms)? {
            if self.wake_tx.try_send(key.clone()).is_err() {
                warn!(key = %key, "wake queue full, will retry next tick");
            }
        }

        Ok(mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chasqui_flows::graph::{handle, Edge, FlowDefinition, FlowNode};
    use chasqui_flows::node::{EndNode, MessageNode, NodeKind};
    use chasqui_queue::Dispatcher;
    use chasqui_sessions::BotSession;
    use chasqui_store::advisors::AdvisorRole;
    use chasqui_store::queues::DistributionMode;
    use chasqui_store::types::{MessageType, NewMessage};

    struct Fixture {
        store: Arc<Store>,
        sessions: Arc<SessionStore>,
        catalog: Arc<FlowCatalog>,
        scheduler: SchedulerEngine,
        wake_rx: mpsc::Receiver<ConversationKey>,
        db_path: std::path::PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn fixture() -> Fixture {
        // File-backed DB so the test can poke columns through a second
        // connection, the way restarts leave them.
        let db_path =
            std::env::temp_dir().join(format!("chasqui-sched-{}.db", uuid::Uuid::new_v4()));
        let store = Arc::new(Store::open(db_path.to_str().unwrap()).unwrap());
        let sessions =
            Arc::new(SessionStore::new(rusqlite::Connection::open(&db_path).unwrap()).unwrap());
        let catalog =
            Arc::new(FlowCatalog::new(rusqlite::Connection::open(&db_path).unwrap()).unwrap());
        let (_dispatcher, queue_handle) = Dispatcher::new(store.clone());
        let queue = Arc::new(QueueEngine::new(store.clone(), queue_handle));
        let (scheduler, wake_rx) =
            SchedulerEngine::new(store.clone(), sessions.clone(), catalog.clone(), queue);
        Fixture {
            store,
            sessions,
            catalog,
            scheduler,
            wake_rx,
            db_path,
        }
    }

    fn raw(f: &Fixture) -> rusqlite::Connection {
        rusqlite::Connection::open(&f.db_path).unwrap()
    }

    fn timeout_flow(f: &Fixture, fallback_queue_id: Option<String>) {
        let flow = FlowDefinition {
            id: "f-bot".into(),
            name: "Bot".into(),
            version: 1,
            nodes: vec![
                FlowNode {
                    id: "n-start".into(),
                    label: None,
                    kind: NodeKind::Start,
                    delay_seconds: None,
                },
                FlowNode {
                    id: "n-msg".into(),
                    label: None,
                    kind: NodeKind::Message(MessageNode { text: "hola".into() }),
                    delay_seconds: None,
                },
                FlowNode {
                    id: "n-end".into(),
                    label: None,
                    kind: NodeKind::End(EndNode::default()),
                    delay_seconds: None,
                },
            ],
            edges: vec![
                Edge {
                    from_node: "n-start".into(),
                    from_handle: handle::DEFAULT.into(),
                    to_node: "n-msg".into(),
                },
                Edge {
                    from_node: "n-msg".into(),
                    from_handle: handle::DEFAULT.into(),
                    to_node: "n-end".into(),
                },
            ],
            bot_timeout_minutes: 30,
            fallback_queue_id,
            allow_unreachable: false,
        };
        f.catalog.save(flow).unwrap();
    }

    fn bot_conversation(f: &Fixture, phone: &str) -> (String, ConversationKey) {
        let key = ConversationKey::new("104", phone);
        let conv = f.store.upsert_on_inbound(&key, None, None).unwrap();
        f.store.start_bot(&conv.id, "f-bot").unwrap();
        let session = BotSession::new(key.clone(), "f-bot", "n-msg");
        f.sessions.put(&session).unwrap();
        (conv.id, key)
    }

    #[tokio::test]
    async fn bot_timeout_transfers_to_fallback() {
        let f = fixture();
        let q = f.store.create_queue("Soporte", DistributionMode::Manual, 5).unwrap();
        timeout_flow(&f, Some(q.id.clone()));
        let (conv_id, key) = bot_conversation(&f, "1");

        // Within the window: untouched.
        let now = now_millis();
        assert_eq!(f.scheduler.bot_timeout_pass(now).await.unwrap(), 0);

        // 31 minutes later: transferred, session gone, system message.
        let later = now + 31 * 60_000;
        assert_eq!(f.scheduler.bot_timeout_pass(later).await.unwrap(), 1);

        let conv = f.store.get_conversation(&conv_id).unwrap();
        assert_eq!(conv.status, ConversationStatus::Active);
        assert!(conv.assigned_to.is_none());
        assert!(conv.bot_flow_id.is_none());
        assert_eq!(conv.queue_id.as_deref(), Some(q.id.as_str()));
        assert!(f.sessions.get(&key).unwrap().is_none());
        let msgs = f.store.get_messages(&conv_id, 10).unwrap();
        assert!(msgs.iter().any(|m| m.msg_type == MessageType::Event));

        // Idempotent: nothing left to do.
        assert_eq!(f.scheduler.bot_timeout_pass(later).await.unwrap(), 0);
        assert_eq!(f.store.count_bot_divergent().unwrap(), 0);
    }

    #[tokio::test]
    async fn bot_pass_recovers_flow_id_from_session() {
        let f = fixture();
        timeout_flow(&f, None);
        let (conv_id, _key) = bot_conversation(&f, "2");

        // Simulate the recovery case: conversation lost its flow id but
        // kept the bot claim.
        raw(&f)
            .execute(
                "UPDATE conversations SET bot_flow_id = NULL WHERE id = ?1",
                rusqlite::params![conv_id],
            )
            .unwrap();
        assert_eq!(f.store.count_bot_divergent().unwrap(), 1);

        assert_eq!(f.scheduler.bot_timeout_pass(now_millis()).await.unwrap(), 1);
        let conv = f.store.get_conversation(&conv_id).unwrap();
        assert_eq!(conv.bot_flow_id.as_deref(), Some("f-bot"));
        assert_eq!(conv.assigned_to.as_deref(), Some(ASSIGNED_BOT));
        assert_eq!(f.store.count_bot_divergent().unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_timeout_releases_quiet_advisors() {
        let f = fixture();
        let q = f.store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let advisor = f
            .store
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        f.store.start_advisor_session(&advisor.id).unwrap();
        f.store.add_queue_member(&q.id, &advisor.id, false).unwrap();

        let key = ConversationKey::new("104", "3");
        let conv = f.store.upsert_on_inbound(&key, None, None).unwrap();
        f.store.enqueue(&conv.id, &q.id).unwrap();
        f.store.assign(&conv.id, &advisor.id).unwrap();
        let assigned_at = f.store.get_conversation(&conv.id).unwrap().assigned_at.unwrap();

        // 9 minutes of silence: first bucket (10 min) not crossed yet.
        assert_eq!(
            f.scheduler.queue_timeout_pass(assigned_at + 9 * 60_000).await.unwrap(),
            0
        );

        // 11 minutes: released back to the queue, escalation level bumps.
        assert_eq!(
            f.scheduler.queue_timeout_pass(assigned_at + 11 * 60_000).await.unwrap(),
            1
        );
        let released = f.store.get_conversation(&conv.id).unwrap();
        assert_eq!(released.status, ConversationStatus::Active);
        assert!(released.assigned_to.is_none());
        assert_eq!(released.queue_id.as_deref(), Some(q.id.as_str()));
        assert_eq!(released.queue_timeout_level, 1);

        // Re-running with no new assignment mutates nothing.
        assert_eq!(
            f.scheduler.queue_timeout_pass(assigned_at + 12 * 60_000).await.unwrap(),
            0
        );

        // Reassigned: the next bucket is 30 minutes, so 11 more silent
        // minutes are fine now.
        f.store.assign(&conv.id, &advisor.id).unwrap();
        let second_assigned = f.store.get_conversation(&conv.id).unwrap().assigned_at.unwrap();
        assert_eq!(
            f.scheduler.queue_timeout_pass(second_assigned + 11 * 60_000).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn advisor_reply_stops_the_clock() {
        let f = fixture();
        let q = f.store.create_queue("Ventas", DistributionMode::Manual, 5).unwrap();
        let advisor = f
            .store
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        f.store.add_queue_member(&q.id, &advisor.id, false).unwrap();
        f.store.start_advisor_session(&advisor.id).unwrap();

        let key = ConversationKey::new("104", "4");
        let conv = f.store.upsert_on_inbound(&key, None, None).unwrap();
        f.store.enqueue(&conv.id, &q.id).unwrap();
        f.store.assign(&conv.id, &advisor.id).unwrap();
        f.store
            .append_message(&conv.id, NewMessage::outbound_text("¿En qué ayudo?", &advisor.id))
            .unwrap();

        let assigned_at = f.store.get_conversation(&conv.id).unwrap().assigned_at.unwrap();
        assert_eq!(
            f.scheduler.queue_timeout_pass(assigned_at + 60 * 60_000).await.unwrap(),
            0
        );
        assert_eq!(
            f.store.get_conversation(&conv.id).unwrap().status,
            ConversationStatus::Attending
        );
    }

    #[tokio::test]
    async fn cleanup_drops_orphans_and_forwards_wakeups() {
        let mut f = fixture();
        timeout_flow(&f, None);

        // Orphan: session without any conversation.
        let orphan_key = ConversationKey::new("104", "999");
        f.sessions
            .put(&BotSession::new(orphan_key.clone(), "f-bot", "n-msg"))
            .unwrap();

        // Due wake-up on a live conversation.
        let (_conv_id, live_key) = bot_conversation(&f, "5");
        let mut session = f.sessions.get(&live_key).unwrap().unwrap();
        session.wake_at = Some(now_millis() - 1_000);
        f.sessions.put(&session).unwrap();

        assert!(f.scheduler.cleanup_pass(now_millis()).await.unwrap() >= 1);
        assert!(f.sessions.get(&orphan_key).unwrap().is_none());
        assert_eq!(f.wake_rx.try_recv().unwrap(), live_key);
    }
}
