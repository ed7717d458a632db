//! Operator authentication: argon2-verified login issuing a bearer token,
//! logout running the release-everything path.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chasqui_store::advisors::Advisor;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let advisor = state
        .store
        .verify_password(&req.username, &req.password)
        .map_err(internal)?
        .ok_or_else(|| {
            warn!(username = %req.username, "login rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid credentials"})),
            )
        })?;

    state.store.start_advisor_session(&advisor.id).map_err(internal)?;
    let token = Uuid::new_v4().to_string();
    state.api_tokens.insert(token.clone(), advisor.id.clone());

    // Coming online can drain queues the advisor belongs to.
    state
        .queue
        .handle()
        .trigger(chasqui_queue::QueueTrigger::AdvisorOnline {
            advisor_id: advisor.id.clone(),
        });

    info!(advisor_id = %advisor.id, "advisor logged in");
    Ok(Json(json!({
        "token": token,
        "advisor": {
            "id": advisor.id,
            "username": advisor.username,
            "display_name": advisor.display_name,
            "role": advisor.role,
            "theme": advisor.theme,
        }
    })))
}

pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let advisor = authed_advisor(&state, &headers)?;
    let released = state
        .queue
        .logout_release(&advisor.id)
        .await
        .map_err(|e| internal(chasqui_core::ChasquiError::from(e)))?;
    state.api_tokens.retain(|_, advisor_id| advisor_id != &advisor.id);
    Ok(Json(json!({ "ok": true, "released": released.len() })))
}

/// Resolve the operator behind a bearer token.
pub fn authed_advisor(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Advisor, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing bearer token"})),
        )
    })?;
    let advisor_id = state
        .api_tokens
        .get(token)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid or expired token"})),
            )
        })?;
    state.store.get_advisor(&advisor_id).map_err(|_| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "advisor no longer exists"})),
        )
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}
