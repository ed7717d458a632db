//! WhatsApp connection management: save (tokens encrypted at rest),
//! check/test against the live provider, verify.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chasqui_core::redact;
use chasqui_wire::outbound::{build_payload, OutboundMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::auth::authed_advisor;
use crate::http::error_response;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn err(e: impl Into<chasqui_core::ChasquiError>) -> (StatusCode, Json<Value>) {
    error_response(e.into())
}

/// Public projection: tokens never leave the server, even masked ones
/// only hint at which credential is stored.
fn public_view(conn: &chasqui_store::connections::ChannelConnection) -> Value {
    json!({
        "id": conn.id,
        "alias": conn.alias,
        "provider_phone_number_id": conn.provider_phone_number_id,
        "display_number": conn.display_number,
        "is_active": conn.is_active,
        "default_queue_id": conn.default_queue_id,
        "default_flow_id": conn.default_flow_id,
        "access_token": redact::mask(&conn.access_token_enc),
        "updated_at": conn.updated_at,
    })
}

pub async fn list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let connections = state.store.list_connections().map_err(err)?;
    Ok(Json(json!({
        "connections": connections.iter().map(public_view).collect::<Vec<_>>()
    })))
}

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub provider_phone_number_id: String,
    pub alias: Option<String>,
    pub display_number: String,
    pub access_token: String,
    pub verify_token: String,
    pub default_queue_id: Option<String>,
    pub default_flow_id: Option<String>,
}

pub async fn save(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SaveRequest>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let connection = state
        .store
        .save_connection(
            &state.secrets,
            &req.provider_phone_number_id,
            req.alias.as_deref(),
            &req.display_number,
            &req.access_token,
            &req.verify_token,
            req.default_queue_id.as_deref(),
            req.default_flow_id.as_deref(),
        )
        .map_err(err)?;
    info!(phone_number_id = %connection.provider_phone_number_id, "connection saved");
    Ok(Json(json!({ "connection": public_view(&connection) })))
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub provider_phone_number_id: String,
}

/// Round-trip the stored credentials against the provider's metadata
/// endpoint.
pub async fn check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CheckRequest>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let connection = state
        .store
        .get_connection(&req.provider_phone_number_id)
        .map_err(err)?
        .ok_or_else(|| err(chasqui_core::ChasquiError::NotFound("connection".into())))?;
    let token = connection.access_token(&state.secrets).map_err(err)?;
    let meta = state
        .wire
        .fetch_phone_meta(&connection.provider_phone_number_id, &token)
        .await
        .map_err(err)?;
    Ok(Json(json!({
        "ok": true,
        "display_phone_number": meta.display_phone_number,
        "verified_name": meta.verified_name,
        "quality_rating": meta.quality_rating,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub provider_phone_number_id: String,
    pub to: String,
    #[serde(default = "default_test_text")]
    pub text: String,
}

fn default_test_text() -> String {
    "Mensaje de prueba de Chasqui ✅".to_string()
}

/// Send a real test message through the connection.
pub async fn test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<TestRequest>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let connection = state
        .store
        .get_connection(&req.provider_phone_number_id)
        .map_err(err)?
        .ok_or_else(|| err(chasqui_core::ChasquiError::NotFound("connection".into())))?;
    let token = connection.access_token(&state.secrets).map_err(err)?;
    let payload = build_payload(&req.to, &OutboundMessage::Text { body: req.text });
    let provider_message_id = state
        .wire
        .send_message(&connection.provider_phone_number_id, &token, &payload)
        .await
        .map_err(err)?;
    Ok(Json(json!({ "ok": true, "provider_message_id": provider_message_id })))
}

/// GET /api/connections/whatsapp/:id/verify, confirm the stored
/// credentials still authenticate.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let connection = state
        .store
        .get_connection(&id)
        .map_err(err)?
        .ok_or_else(|| err(chasqui_core::ChasquiError::NotFound("connection".into())))?;
    let token = connection.access_token(&state.secrets).map_err(err)?;
    match state
        .wire
        .fetch_phone_meta(&connection.provider_phone_number_id, &token)
        .await
    {
        Ok(meta) => Ok(Json(json!({
            "verified": true,
            "display_phone_number": meta.display_phone_number,
        }))),
        Err(chasqui_wire::WireError::InvalidToken) => Ok(Json(json!({
            "verified": false,
            "reason": "invalid token"
        }))),
        Err(e) => Err(err(e)),
    }
}
