// End-to-end macro-step scenarios against in-memory stores and a
// recording sender, so node semantics and ordering are checked without a
// provider.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chasqui_core::secrets::SecretStore;
use chasqui_core::types::{ConversationKey, ASSIGNED_BOT};
use chasqui_engine::{FlowRuntime, OutboundSender, StepEnd};
use chasqui_flows::graph::{handle, Edge, FlowDefinition, FlowNode};
use chasqui_flows::node::*;
use chasqui_flows::FlowCatalog;
use chasqui_queue::{Dispatcher, QueueEngine};
use chasqui_sessions::{Awaiting, SessionStore};
use chasqui_store::connections::ChannelConnection;
use chasqui_store::types::{ConversationStatus, Direction, Message, MessageStatus, MessageType, NewMessage};
use chasqui_store::Store;
use chasqui_wire::envelope::{parse_envelope, WebhookEnvelope};
use chasqui_wire::event::{InboundEvent, InboundKind};
use chasqui_wire::outbound::OutboundMessage;

struct RecordingSender {
    store: Arc<Store>,
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl OutboundSender for RecordingSender {
    async fn deliver(
        &self,
        conversation_id: &str,
        msg: &OutboundMessage,
        sent_by: &str,
    ) -> chasqui_core::Result<Message> {
        self.sent.lock().unwrap().push(msg.clone());
        let stored = self.store.append_message(
            conversation_id,
            NewMessage {
                direction: Some(Direction::Out),
                msg_type: Some(match msg {
                    OutboundMessage::Text { .. } => MessageType::Text,
                    OutboundMessage::Buttons { .. } | OutboundMessage::List { .. } => {
                        MessageType::Buttons
                    }
                    OutboundMessage::Media { .. } => MessageType::Media,
                    OutboundMessage::Template { .. } => MessageType::Template,
                }),
                text: Some(chasqui_wire::outbound::preview_text(msg)),
                sent_by: Some(sent_by.to_string()),
                status: Some(MessageStatus::Sent),
                ..Default::default()
            },
        )?;
        Ok(stored)
    }
}

struct Fixture {
    store: Arc<Store>,
    sessions: Arc<SessionStore>,
    catalog: Arc<FlowCatalog>,
    runtime: Arc<FlowRuntime>,
    sender: Arc<RecordingSender>,
    connection: ChannelConnection,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let sessions =
        Arc::new(SessionStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let catalog =
        Arc::new(FlowCatalog::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let sender = Arc::new(RecordingSender {
        store: store.clone(),
        sent: Mutex::new(Vec::new()),
    });
    let (_dispatcher, queue_handle) = Dispatcher::new(store.clone());
    let queue = Arc::new(QueueEngine::new(store.clone(), queue_handle));

    let secrets = SecretStore::new("engine-test-secret").unwrap();
    let connection = store
        .save_connection(
            &secrets,
            "104858275551234",
            None,
            "+51 1 700 0000",
            "EAAG-token",
            "verify-token",
            None,
            None,
        )
        .unwrap();

    let runtime = Arc::new(FlowRuntime::new(
        store.clone(),
        sessions.clone(),
        catalog.clone(),
        sender.clone(),
        queue,
        None,
        None,
        -300,
    ));

    Fixture {
        store,
        sessions,
        catalog,
        runtime,
        sender,
        connection,
    }
}

fn node(id: &str, kind: NodeKind) -> FlowNode {
    FlowNode {
        id: id.into(),
        label: None,
        kind,
        delay_seconds: None,
    }
}

fn edge(from: &str, h: &str, to: &str) -> Edge {
    Edge {
        from_node: from.into(),
        from_handle: h.into(),
        to_node: to.into(),
    }
}

fn flow(id: &str, nodes: Vec<FlowNode>, edges: Vec<Edge>) -> FlowDefinition {
    FlowDefinition {
        id: id.into(),
        name: id.into(),
        version: 1,
        nodes,
        edges,
        bot_timeout_minutes: 30,
        fallback_queue_id: None,
        allow_unreachable: false,
    }
}

fn inbound_text(phone: &str, body: &str, wamid: &str) -> InboundEvent {
    InboundEvent {
        key: ConversationKey::new("104858275551234", phone),
        display_number: None,
        contact_name: Some("Ana".into()),
        kind: InboundKind::Text { body: body.into() },
        provider_message_id: Some(wamid.into()),
        provider_timestamp: Some(1_700_000_000),
    }
}

fn button_reply(phone: &str, id: &str, title: &str, wamid: &str) -> InboundEvent {
    InboundEvent {
        key: ConversationKey::new("104858275551234", phone),
        display_number: None,
        contact_name: None,
        kind: InboundKind::ButtonReply {
            id: id.into(),
            title: title.into(),
        },
        provider_message_id: Some(wamid.into()),
        provider_timestamp: None,
    }
}

fn install_entry_flow(f: &Fixture, definition: FlowDefinition) {
    let saved = f.catalog.save(definition).unwrap();
    f.catalog.set_default(&saved.id).unwrap();
}

#[tokio::test]
async fn welcome_then_menu() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-bienvenida",
            vec![
                node("n-start", NodeKind::Start),
                node("n-hola", NodeKind::Message(MessageNode { text: "Hola".into() })),
                node(
                    "n-menu",
                    NodeKind::Buttons(ButtonsNode {
                        prompt: "Elige".into(),
                        options: vec![
                            NodeOption { label: "A".into() },
                            NodeOption { label: "B".into() },
                        ],
                        retry_message: None,
                        max_retries: 3,
                    }),
                ),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-hola"),
                edge("n-hola", handle::DEFAULT, "n-menu"),
                edge("n-menu", &handle::option(0), "n-end"),
                edge("n-menu", &handle::option(1), "n-end"),
            ],
        ),
    );

    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("51999000001", "hola", "wamid.1"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Waiting);

    // Two outbound messages in authorship order: text then buttons.
    let sent = f.sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], OutboundMessage::Text { body } if body == "Hola"));
    assert!(matches!(&sent[1], OutboundMessage::Buttons { options, .. } if options.len() == 2));
    drop(sent);

    // Session is waiting on buttons; conversation is bot-owned.
    let key = ConversationKey::new("104858275551234", "51999000001");
    let session = f.sessions.get(&key).unwrap().unwrap();
    assert_eq!(session.awaiting, Awaiting::Buttons);
    assert_eq!(session.current_node_id, "n-menu");

    let conv = f.store.find_active_by_key(&key).unwrap().unwrap();
    assert_eq!(conv.assigned_to.as_deref(), Some(ASSIGNED_BOT));
    assert_eq!(conv.bot_flow_id.as_deref(), Some("f-bienvenida"));

    // Button reply follows the matching option handle and ends the flow.
    let end = f
        .runtime
        .handle_inbound(&f.connection, &button_reply("51999000001", "opt:1", "B", "wamid.2"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Ended);
    assert!(f.sessions.get(&key).unwrap().is_none());
    let conv = f.store.find_active_by_key(&key).unwrap().unwrap();
    assert!(conv.bot_flow_id.is_none());
    assert!(conv.assigned_to.is_none());
}

#[tokio::test]
async fn validation_retry_then_capture() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-email",
            vec![
                node("n-start", NodeKind::Start),
                node(
                    "n-email",
                    NodeKind::Question(QuestionNode {
                        prompt: "¿Tu correo?".into(),
                        var_name: "email".into(),
                        input: QuestionInput::Text,
                        validation: Some(ValidationMode::Format(FormatConfig {
                            pattern: FormatPattern::Email,
                        })),
                        retry_message: Some("Ese correo no parece válido.".into()),
                        max_retries: 3,
                    }),
                ),
                node("n-gracias", NodeKind::Message(MessageNode { text: "Gracias {{email}}".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-email"),
                edge("n-email", handle::DEFAULT, "n-gracias"),
                edge("n-gracias", handle::DEFAULT, "n-end"),
            ],
        ),
    );

    f.runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();

    // Invalid reply → retry message, retry_count = 1.
    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "no", "wamid.2"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Waiting);
    let key = ConversationKey::new("104858275551234", "519");
    let session = f.sessions.get(&key).unwrap().unwrap();
    assert_eq!(session.retry_count, 1);
    {
        let sent = f.sender.sent.lock().unwrap();
        assert!(matches!(
            sent.last().unwrap(),
            OutboundMessage::Text { body } if body == "Ese correo no parece válido."
        ));
    }

    // Valid reply → variable captured, substituted thank-you, flow ends.
    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "ok@example.com", "wamid.3"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Ended);
    let sent = f.sender.sent.lock().unwrap();
    assert!(matches!(
        sent.last().unwrap(),
        OutboundMessage::Text { body } if body == "Gracias ok@example.com"
    ));
}

#[tokio::test]
async fn duplicate_inbound_is_idempotent() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-uno",
            vec![
                node("n-start", NodeKind::Start),
                node("n-msg", NodeKind::Message(MessageNode { text: "Hola".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-msg"),
                edge("n-msg", handle::DEFAULT, "n-end"),
            ],
        ),
    );

    let event = inbound_text("519", "hola", "wamid.dup");
    f.runtime.handle_inbound(&f.connection, &event).await.unwrap();
    let sends_after_first = f.sender.sent.lock().unwrap().len();

    let end = f.runtime.handle_inbound(&f.connection, &event).await.unwrap();
    assert_eq!(end, StepEnd::NoStep);
    assert_eq!(f.sender.sent.lock().unwrap().len(), sends_after_first);
}

#[tokio::test]
async fn transfer_node_hands_off_and_stops() {
    let f = fixture();
    let queue = f
        .store
        .create_queue("Ventas", chasqui_store::queues::DistributionMode::Manual, 5)
        .unwrap();
    install_entry_flow(
        &f,
        flow(
            "f-transfer",
            vec![
                node("n-start", NodeKind::Start),
                node(
                    "n-transfer",
                    NodeKind::Transfer(TransferNode {
                        queue_id: queue.id.clone(),
                        reason: None,
                    }),
                ),
            ],
            vec![edge("n-start", handle::DEFAULT, "n-transfer")],
        ),
    );

    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Transferred);

    let key = ConversationKey::new("104858275551234", "519");
    let conv = f.store.find_active_by_key(&key).unwrap().unwrap();
    assert_eq!(conv.status, ConversationStatus::Active);
    assert!(conv.assigned_to.is_none());
    assert_eq!(conv.queue_id.as_deref(), Some(queue.id.as_str()));
    assert!(conv.queued_at.is_some());
    assert!(conv.bot_flow_id.is_none());
    assert!(conv.bot_started_at.is_none());
    // session died with the handoff
    assert!(f.sessions.get(&key).unwrap().is_none());
    // and a system event message landed
    let msgs = f.store.get_messages(&conv.id, 20).unwrap();
    assert!(msgs
        .iter()
        .any(|m| m.msg_type == MessageType::Event
            && m.text.as_deref().unwrap_or_default().contains("Ventas")));
}

#[tokio::test]
async fn text_menu_accepts_digit_and_retries_out_of_range() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-menu",
            vec![
                node("n-start", NodeKind::Start),
                node(
                    "n-menu",
                    NodeKind::Menu(MenuNode {
                        prompt: "Escribe el número:".into(),
                        options: vec![
                            NodeOption { label: "Ventas".into() },
                            NodeOption { label: "Soporte".into() },
                        ],
                        mode: MenuMode::Text,
                        retry_message: None,
                        max_retries: 3,
                    }),
                ),
                node("n-v", NodeKind::Message(MessageNode { text: "Ventas!".into() })),
                node("n-s", NodeKind::Message(MessageNode { text: "Soporte!".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-menu"),
                edge("n-menu", &handle::option(0), "n-v"),
                edge("n-menu", &handle::option(1), "n-s"),
                edge("n-v", handle::DEFAULT, "n-end"),
                edge("n-s", handle::DEFAULT, "n-end"),
            ],
        ),
    );

    f.runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();
    // menu prompt listed options as numbered lines
    {
        let sent = f.sender.sent.lock().unwrap();
        assert!(matches!(
            sent.last().unwrap(),
            OutboundMessage::Text { body } if body.contains("1. Ventas") && body.contains("2. Soporte")
        ));
    }

    // Out-of-range digit → retry.
    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "9", "wamid.2"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Waiting);
    let key = ConversationKey::new("104858275551234", "519");
    assert_eq!(f.sessions.get(&key).unwrap().unwrap().retry_count, 1);

    // "2" → second option.
    f.runtime
        .handle_inbound(&f.connection, &inbound_text("519", "2", "wamid.3"))
        .await
        .unwrap();
    let sent = f.sender.sent.lock().unwrap();
    assert!(sent
        .iter()
        .any(|m| matches!(m, OutboundMessage::Text { body } if body == "Soporte!")));
}

#[tokio::test]
async fn delay_suspends_and_resumes() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-delay",
            vec![
                node("n-start", NodeKind::Start),
                node("n-uno", NodeKind::Message(MessageNode { text: "uno".into() })),
                node(
                    "n-wait",
                    NodeKind::Delay(DelayNode { delay_seconds: 3600, interruptible: false }),
                ),
                node("n-dos", NodeKind::Message(MessageNode { text: "dos".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-uno"),
                edge("n-uno", handle::DEFAULT, "n-wait"),
                edge("n-wait", handle::DEFAULT, "n-dos"),
                edge("n-dos", handle::DEFAULT, "n-end"),
            ],
        ),
    );

    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Suspended);

    let key = ConversationKey::new("104858275551234", "519");
    let mut session = f.sessions.get(&key).unwrap().unwrap();
    assert!(session.wake_at.unwrap() > chasqui_core::types::now_millis());
    assert_eq!(session.current_node_id, "n-wait");

    // A message during a non-interruptible delay changes nothing.
    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "sigues ahí?", "wamid.2"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Suspended);
    assert_eq!(f.sender.sent.lock().unwrap().len(), 1);

    // Force the durable wake time into the past, as after a restart.
    session = f.sessions.get(&key).unwrap().unwrap();
    session.wake_at = Some(chasqui_core::types::now_millis() - 1_000);
    f.sessions.put(&session).unwrap();

    let end = f.runtime.resume_wakeup(&key).await.unwrap();
    assert_eq!(end, StepEnd::Ended);
    let sent = f.sender.sent.lock().unwrap();
    assert!(matches!(sent.last().unwrap(), OutboundMessage::Text { body } if body == "dos"));
}

#[tokio::test]
async fn interruptible_delay_cancels_on_inbound() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-delay-int",
            vec![
                node("n-start", NodeKind::Start),
                node(
                    "n-wait",
                    NodeKind::Delay(DelayNode { delay_seconds: 3600, interruptible: true }),
                ),
                node("n-dos", NodeKind::Message(MessageNode { text: "seguimos".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-wait"),
                edge("n-wait", handle::DEFAULT, "n-dos"),
                edge("n-dos", handle::DEFAULT, "n-end"),
            ],
        ),
    );

    f.runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();

    let end = f
        .runtime
        .handle_inbound(&f.connection, &inbound_text("519", "ya volví", "wamid.2"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::Ended);
    let sent = f.sender.sent.lock().unwrap();
    assert!(matches!(sent.last().unwrap(), OutboundMessage::Text { body } if body == "seguimos"));
}

#[tokio::test]
async fn no_entry_flow_queues_to_channel_default() {
    let f = fixture();
    let queue = f
        .store
        .create_queue("Recepción", chasqui_store::queues::DistributionMode::Manual, 5)
        .unwrap();
    let secrets = SecretStore::new("engine-test-secret").unwrap();
    let connection = f
        .store
        .save_connection(
            &secrets,
            "104858275551234",
            None,
            "+51 1 700 0000",
            "EAAG-token",
            "verify-token",
            Some(&queue.id),
            None,
        )
        .unwrap();

    let end = f
        .runtime
        .handle_inbound(&connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();
    assert_eq!(end, StepEnd::NoStep);

    let key = ConversationKey::new("104858275551234", "519");
    let conv = f.store.find_active_by_key(&key).unwrap().unwrap();
    assert_eq!(conv.queue_id.as_deref(), Some(queue.id.as_str()));
    assert!(conv.queued_at.is_some());
    assert!(conv.assigned_to.is_none());
}

#[tokio::test]
async fn status_update_advances_message() {
    let f = fixture();
    install_entry_flow(
        &f,
        flow(
            "f-uno",
            vec![
                node("n-start", NodeKind::Start),
                node("n-msg", NodeKind::Message(MessageNode { text: "Hola".into() })),
                node("n-end", NodeKind::End(EndNode::default())),
            ],
            vec![
                edge("n-start", handle::DEFAULT, "n-msg"),
                edge("n-msg", handle::DEFAULT, "n-end"),
            ],
        ),
    );
    f.runtime
        .handle_inbound(&f.connection, &inbound_text("519", "hola", "wamid.1"))
        .await
        .unwrap();

    // Wire a provider id onto the stored outbound, then deliver a status
    // update envelope for it.
    let key = ConversationKey::new("104858275551234", "519");
    let conv = f.store.find_active_by_key(&key).unwrap().unwrap();
    let outbound = f
        .store
        .get_messages(&conv.id, 10)
        .unwrap()
        .into_iter()
        .find(|m| m.direction == Direction::Out)
        .unwrap();
    f.store.confirm_sent(&outbound.id, "wamid.out1").unwrap();

    let envelope: WebhookEnvelope = serde_json::from_str(
        r#"{
          "object": "whatsapp_business_account",
          "entry": [{
            "id": "1",
            "changes": [{
              "field": "messages",
              "value": {
                "messaging_product": "whatsapp",
                "metadata": {"phone_number_id": "104858275551234"},
                "statuses": [{
                  "id": "wamid.out1", "status": "read",
                  "timestamp": "1700000100", "recipient_id": "519"
                }]
              }
            }]
          }]
        }"#,
    )
    .unwrap();
    for event in parse_envelope(&envelope) {
        f.runtime.handle_inbound(&f.connection, &event).await.unwrap();
    }

    let updated = f.store.get_message(&outbound.id).unwrap();
    assert_eq!(updated.status, MessageStatus::Read);
}
