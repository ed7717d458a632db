//! The realtime bus: an authenticated WebSocket hub fanning out store
//! change records to subscribed operator clients.
//!
//! Ordering: the hub consumes the store's broadcast channel sequentially
//! and each client has an ordered bounded queue, so events for one
//! conversation arrive in publication order. A client that cannot keep up
//! is dropped with a close code and re-bootstraps over REST.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use chasqui_core::config::{CLIENT_QUEUE_CAPACITY, HEARTBEAT_INTERVAL_SECS, MAX_PAYLOAD_BYTES};
use chasqui_store::ChangeRecord;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{AppState, WsOut, WsSender};
use crate::auth::bearer_token;

/// Slow-consumer close code.
const CLOSE_SLOW_CONSUMER: u16 = 4008;

pub struct ClientHandle {
    pub tx: WsSender,
    pub subscriptions: Arc<RwLock<HashSet<String>>>,
}

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /api/crm/ws, bearer auth (header or `?token=`), then upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsAuthQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let Some(expected) = state.config.server.realtime_auth_key.clone() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let presented = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token);
    if presented.as_deref() != Some(expected.as_str()) {
        warn!("WS auth rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(|socket| handle_connection(socket, state))
        .into_response()
}

/// Per-connection task, lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, "WS client connected");

    let (out_tx, mut out_rx) = mpsc::channel::<WsOut>(CLIENT_QUEUE_CAPACITY);
    let subscriptions = Arc::new(RwLock::new(HashSet::new()));
    state.ws_clients.insert(
        client_id.clone(),
        ClientHandle {
            tx: out_tx,
            subscriptions: subscriptions.clone(),
        },
    );

    let (mut tx, mut rx) = socket.split();

    let welcome = json!({
        "type": "welcome",
        "client_id": client_id,
        "server_time": chasqui_core::types::now_millis(),
    });
    if tx.send(Message::Text(welcome.to_string().into())).await.is_err() {
        state.ws_clients.remove(&client_id);
        return;
    }

    let heartbeat = std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seen = tokio::time::Instant::now();

    loop {
        tokio::select! {
            // client sent us something
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = tokio::time::Instant::now();
                        let text: &str = &text;
                        if text.len() > MAX_PAYLOAD_BYTES {
                            let _ = send_json(&mut tx, &json!({
                                "type": "error", "reason": "payload too large"
                            })).await;
                            continue;
                        }
                        // A bad frame answers with an error, never a close.
                        let reply = handle_client_frame(&state, &subscriptions, text);
                        if send_json(&mut tx, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = tokio::time::Instant::now();
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }

            // hub pushed an event for this client
            out = out_rx.recv() => {
                match out {
                    Some(WsOut::Frame(payload)) => {
                        if tx.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsOut::Close { code, reason }) => {
                        let _ = tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        }))).await;
                        break;
                    }
                    // the hub dropped us as a slow consumer
                    None => {
                        let _ = tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: CLOSE_SLOW_CONSUMER,
                            reason: "slow consumer".into(),
                        }))).await;
                        break;
                    }
                }
            }

            // heartbeat + idle eviction
            _ = ping_interval.tick() => {
                if last_seen.elapsed() > heartbeat * 2 {
                    info!(client_id = %client_id, "evicting idle WS client");
                    break;
                }
                if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.ws_clients.remove(&client_id);
    info!(client_id = %client_id, "WS client disconnected");
}

/// Typed client frames. Parsing is separate from execution so shape
/// errors are uniform (and testable) regardless of state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Hello,
    Subscribe {
        conversation_ids: Vec<String>,
    },
    Typing {
        conversation_id: String,
        #[serde(default)]
        advisor_id: Option<String>,
        state: bool,
    },
    Read {
        conversation_id: String,
        #[serde(default)]
        up_to_message_id: Option<String>,
    },
}

fn parse_frame(text: &str) -> Result<ClientFrame, String> {
    serde_json::from_str(text).map_err(|e| format!("malformed frame: {e}"))
}

/// Handle one client frame; returns the reply frame.
fn handle_client_frame(
    state: &AppState,
    subscriptions: &Arc<RwLock<HashSet<String>>>,
    text: &str,
) -> Value {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(reason) => return json!({ "type": "error", "reason": reason }),
    };

    match frame {
        ClientFrame::Hello => json!({ "type": "ack", "for": "hello" }),

        ClientFrame::Subscribe { conversation_ids } => {
            let mut subs = subscriptions.write().unwrap();
            subs.extend(conversation_ids);
            json!({ "type": "ack", "for": "subscribe", "count": subs.len() })
        }

        ClientFrame::Typing {
            conversation_id,
            advisor_id,
            state: typing_state,
        } => {
            state.store.changes().publish(ChangeRecord::Typing {
                conversation_id,
                advisor_id: advisor_id.unwrap_or_else(|| "operator".to_string()),
                state: typing_state,
            });
            json!({ "type": "ack", "for": "typing" })
        }

        ClientFrame::Read {
            conversation_id,
            up_to_message_id: _,
        } => match state.store.mark_read(&conversation_id) {
            Ok(_) => json!({ "type": "ack", "for": "read" }),
            Err(e) => json!({ "type": "error", "reason": e.to_string() }),
        },
    }
}

async fn send_json(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    payload: &Value,
) -> Result<(), axum::Error> {
    tx.send(Message::Text(payload.to_string().into())).await
}

/// The fan-out pump: consumes the store's change broadcast and routes
/// events into per-client queues. Run as one background task.
pub async fn run_hub(state: Arc<AppState>) {
    let mut changes = state.store.changes().subscribe();
    info!("realtime hub started");

    loop {
        let record = match changes.recv().await {
            Ok(record) => record,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "hub lagged behind the change bus");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let seq = state.next_seq();
        let (frame, broadcast_all) = encode_record(&record, seq);
        let conversation_id = record.conversation_id().to_string();
        let payload = frame.to_string();

        let mut slow: Vec<String> = Vec::new();
        for entry in state.ws_clients.iter() {
            let subscribed = broadcast_all
                || entry
                    .value()
                    .subscriptions
                    .read()
                    .unwrap()
                    .contains(&conversation_id);
            if !subscribed {
                continue;
            }
            match entry.value().tx.try_send(WsOut::Frame(payload.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %entry.key(), "WS client queue overflow, dropping");
                    slow.push(entry.key().clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(entry.key().clone());
                }
            }
        }
        // Removing the handle closes the client's queue; its task sends
        // the slow-consumer close and exits.
        for client_id in slow {
            state.ws_clients.remove(&client_id);
        }
    }
    debug!("realtime hub stopped");
}

/// Encode a change record as a wire frame. The bool says whether the
/// frame goes to every client (conversation metadata) or subscribers only.
fn encode_record(record: &ChangeRecord, seq: u64) -> (Value, bool) {
    match record {
        ChangeRecord::MessageNew {
            conversation_id,
            message,
        } => (
            json!({
                "type": "event.crm:msg:new",
                "conversation_id": conversation_id,
                "message": message,
                "seq": seq,
            }),
            false,
        ),
        ChangeRecord::MessageStatus {
            conversation_id,
            message_id,
            status,
        } => (
            json!({
                "type": "event.crm:msg:update",
                "conversation_id": conversation_id,
                "message_id": message_id,
                "status": status,
                "seq": seq,
            }),
            false,
        ),
        ChangeRecord::ConversationUpdated { conversation } => (
            json!({
                "type": "event.crm:conv:update",
                "conversation": conversation,
                "seq": seq,
            }),
            true,
        ),
        ChangeRecord::Typing {
            conversation_id,
            advisor_id,
            state,
        } => (
            json!({
                "type": "event.crm:typing",
                "conversation_id": conversation_id,
                "advisor_id": advisor_id,
                "state": state,
                "seq": seq,
            }),
            false,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chasqui_store::types::{Direction, Message, MessageStatus, MessageType};

    fn message(id: &str, conversation_id: &str) -> Message {
        Message {
            id: id.into(),
            conversation_id: conversation_id.into(),
            direction: Direction::Out,
            msg_type: MessageType::Text,
            text: Some("hola".into()),
            media_url: None,
            media_thumb: None,
            replied_to_id: None,
            status: MessageStatus::Sent,
            timestamp: 0,
            event_type: None,
            sent_by: Some("bot".into()),
            provider_message_id: None,
            provider_metadata: None,
        }
    }

    #[test]
    fn msg_new_targets_subscribers_only() {
        let record = ChangeRecord::MessageNew {
            conversation_id: "c-1".into(),
            message: message("m-1", "c-1"),
        };
        let (frame, broadcast_all) = encode_record(&record, 7);
        assert!(!broadcast_all);
        assert_eq!(frame["type"], "event.crm:msg:new");
        assert_eq!(frame["seq"], 7);
        assert_eq!(frame["message"]["id"], "m-1");
    }

    #[test]
    fn conv_update_goes_to_everyone() {
        let conversation = serde_json::from_value(serde_json::json!({
            "id": "c-1", "channel": "whatsapp", "channel_connection_id": "104",
            "remote_phone": "519", "display_number": "+519", "contact_name": null,
            "status": "active", "assigned_to": null, "assigned_at": null,
            "queued_at": null, "queue_id": null, "bot_flow_id": null,
            "bot_started_at": null, "ticket_number": 1, "attended_by": [],
            "active_advisors": [], "transferred_from": null, "transferred_at": null,
            "queue_timeout_level": 0, "unread": 0, "last_message_preview": null,
            "last_message_at": null, "created_at": 0, "updated_at": 0
        }))
        .unwrap();
        let (frame, broadcast_all) =
            encode_record(&ChangeRecord::ConversationUpdated { conversation }, 1);
        assert!(broadcast_all);
        assert_eq!(frame["type"], "event.crm:conv:update");
    }

    #[test]
    fn client_frames_parse() {
        assert_eq!(parse_frame(r#"{"type":"hello"}"#).unwrap(), ClientFrame::Hello);
        assert_eq!(
            parse_frame(r#"{"type":"subscribe","conversation_ids":["c-1","c-2"]}"#).unwrap(),
            ClientFrame::Subscribe {
                conversation_ids: vec!["c-1".into(), "c-2".into()]
            }
        );
        assert_eq!(
            parse_frame(r#"{"type":"typing","conversation_id":"c-1","state":true}"#).unwrap(),
            ClientFrame::Typing {
                conversation_id: "c-1".into(),
                advisor_id: None,
                state: true
            }
        );
        assert_eq!(
            parse_frame(r#"{"type":"read","conversation_id":"c-1","up_to_message_id":"m-9"}"#)
                .unwrap(),
            ClientFrame::Read {
                conversation_id: "c-1".into(),
                up_to_message_id: Some("m-9".into())
            }
        );
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"no_type":true}"#).is_err());
        assert!(parse_frame(r#"{"type":"dance"}"#).is_err());
        assert!(parse_frame(r#"{"type":"subscribe"}"#).is_err());
    }
}
