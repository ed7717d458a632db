//! Provider webhook ingress.
//!
//! GET handles the subscribe handshake; POST acknowledges within the
//! provider's deadline and processes asynchronously behind a bounded
//! per-channel ingress gate.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chasqui_core::config::INGRESS_QUEUE_CAPACITY;
use chasqui_wire::envelope::{parse_envelope, WebhookEnvelope};
use chasqui_wire::verify;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook/whatsapp, echo the challenge iff the presented token
/// matches any active connection's stored verify token.
pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let connections = match state.store.list_connections() {
        Ok(connections) => connections,
        Err(e) => {
            warn!(error = %e, "connection listing failed during verify");
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
        }
    };

    for connection in connections.iter().filter(|c| c.is_active) {
        let Ok(stored) = connection.verify_token(&state.secrets) else {
            continue;
        };
        if let Some(challenge) = verify::verify_subscribe(
            query.mode.as_deref(),
            query.verify_token.as_deref(),
            query.challenge.as_deref(),
            &stored,
        ) {
            info!(connection = %connection.provider_phone_number_id, "webhook verified");
            return (StatusCode::OK, challenge);
        }
    }

    warn!("webhook verify rejected");
    (StatusCode::FORBIDDEN, String::new())
}

/// POST /webhook/whatsapp, always 200 fast; the envelope is processed in
/// a spawned task. Saturated channels answer 429.
pub async fn inbound_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(app_secret) = &state.config.provider.app_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());
        if let Err(reason) = verify::verify_signature(app_secret, &body, signature) {
            warn!(%reason, "webhook signature rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed webhook body");
            // Still 200: the provider retries hard on anything else and
            // the payload will never become parseable.
            return StatusCode::OK;
        }
    };

    if state.config.maintenance_mode {
        debug!("maintenance mode: webhook acknowledged and dropped");
        return StatusCode::OK;
    }

    let events = parse_envelope(&envelope);
    if events.is_empty() {
        return StatusCode::OK;
    }

    // One permit per in-flight event, per channel.
    let channel_id = events[0].key.channel_connection_id.clone();
    let gate = state
        .ingress
        .entry(channel_id.clone())
        .or_insert_with(|| Arc::new(Semaphore::new(INGRESS_QUEUE_CAPACITY)))
        .clone();
    let Ok(permit) = gate.try_acquire_many_owned(events.len() as u32) else {
        warn!(channel_id, "ingress queue saturated, rejecting webhook");
        return StatusCode::TOO_MANY_REQUESTS;
    };

    tokio::spawn(async move {
        let _permit = permit;
        for event in events {
            let connection = match state.store.get_connection(&event.key.channel_connection_id) {
                Ok(Some(connection)) if connection.is_active => connection,
                Ok(_) => {
                    warn!(channel = %event.key.channel_connection_id, "event for unknown or inactive connection");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "connection lookup failed");
                    continue;
                }
            };
            if let Err(e) = state.engine.handle_inbound(&connection, &event).await {
                warn!(key = %event.key, error = %e, "inbound processing failed");
            }
        }
    });

    StatusCode::OK
}

/// POST /webhook/flows/:conversation_id, correlated inbound for parked
/// webhook_in nodes.
pub async fn flow_correlate_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    axum::Json(payload): axum::Json<Value>,
) -> impl IntoResponse {
    match state.engine.correlate_webhook(&conversation_id, payload).await {
        Ok(true) => StatusCode::OK,
        Ok(false) => StatusCode::CONFLICT,
        Err(e) => {
            warn!(conversation_id, error = %e, "webhook correlation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
