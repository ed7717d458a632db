//! Operator REST: conversation listings and actions, queue and advisor
//! configuration.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chasqui_core::types::ASSIGNED_BOT;
use chasqui_store::advisors::AdvisorRole;
use chasqui_store::conversations::ConversationFilter;
use chasqui_store::queues::DistributionMode;
use chasqui_store::types::ConversationStatus;
use chasqui_wire::outbound::OutboundMessage;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::auth::authed_advisor;
use crate::http::error_response;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn err(e: impl Into<chasqui_core::ChasquiError>) -> (StatusCode, Json<Value>) {
    error_response(e.into())
}

// ── Listings ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub queue_id: Option<String>,
    pub mine: Option<bool>,
    pub limit: Option<usize>,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    let filter = ConversationFilter {
        status: query.status.as_deref().and_then(|s| s.parse().ok()),
        queue_id: query.queue_id,
        assigned_to: if query.mine.unwrap_or(false) {
            Some(advisor.id)
        } else {
            None
        },
        limit: query.limit,
    };
    let conversations = state.store.list_conversations(&filter).map_err(err)?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let messages = state
        .store
        .get_messages(&id, query.limit.unwrap_or(100))
        .map_err(err)?;
    // Listing a conversation clears its unread counter for the panel.
    state.store.mark_read(&id).map_err(err)?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let attachments = state.store.get_attachments(&id).map_err(err)?;
    Ok(Json(json!({ "attachments": attachments })))
}

// ── Conversation actions ──────────────────────────────────────────────────

pub async fn accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    state.queue.accept(&id, &advisor.id).await.map_err(err)?;
    let conversation = state.store.get_conversation(&id).map_err(err)?;
    Ok(Json(json!({ "conversation": conversation })))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub to_queue: Option<String>,
    pub to_advisor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TransferRequest>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    match (&req.to_queue, &req.to_advisor) {
        (Some(queue_id), None) => {
            state
                .queue
                .transfer_to_queue(&id, queue_id, req.reason.as_deref(), Some(&advisor.id))
                .await
                .map_err(err)?;
        }
        (None, Some(target)) => {
            state
                .queue
                .transfer_to_advisor(&id, target, &advisor.id)
                .await
                .map_err(err)?;
        }
        _ => {
            return Err(err(chasqui_core::ChasquiError::Validation(
                "exactly one of to_queue / to_advisor is required".into(),
            )))
        }
    }
    let conversation = state.store.get_conversation(&id).map_err(err)?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn release(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    state.queue.release(&id, &advisor.id).await.map_err(err)?;
    let conversation = state.store.get_conversation(&id).map_err(err)?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    let _guard = state.store.lock_conversation(&id).await;
    let conversation = state.store.close(&id, Some(&advisor.id)).map_err(err)?;
    Ok(Json(json!({ "conversation": conversation })))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub text: String,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> ApiResult {
    let advisor = authed_advisor(&state, &headers)?;
    let conversation = state.store.get_conversation(&id).map_err(err)?;
    if conversation.status == ConversationStatus::Closed {
        return Err(err(chasqui_core::ChasquiError::Conflict(
            "conversation is closed".into(),
        )));
    }
    if conversation.assigned_to.as_deref() == Some(ASSIGNED_BOT) {
        return Err(err(chasqui_core::ChasquiError::Conflict(
            "conversation is bot-owned".into(),
        )));
    }

    let _guard = state.store.lock_conversation(&id).await;
    let message = state
        .sender
        .deliver(&id, &OutboundMessage::Text { body: req.text }, &advisor.id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "message": message })))
}

#[derive(Debug, Deserialize)]
pub struct AttachmentRequest {
    pub kind: String,
    pub url: String,
    pub thumbnail: Option<String>,
    pub filename: String,
    pub mimetype: String,
    #[serde(default)]
    pub size: i64,
}

pub async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
    Json(req): Json<AttachmentRequest>,
) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let attachment = state
        .store
        .link_attachment(
            &message_id,
            &req.kind,
            &req.url,
            req.thumbnail.as_deref(),
            &req.filename,
            &req.mimetype,
            req.size,
        )
        .map_err(err)?;
    Ok(Json(json!({ "attachment": attachment })))
}

// ── Queue / advisor configuration ─────────────────────────────────────────

pub async fn list_queues(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let queues = state.store.list_queues().map_err(err)?;
    Ok(Json(json!({ "queues": queues })))
}

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    pub distribution_mode: DistributionMode,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: i64,
}

fn default_max_concurrent() -> i64 {
    5
}

pub async fn create_queue(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateQueueRequest>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let queue = state
        .store
        .create_queue(&req.name, req.distribution_mode, req.max_concurrent)
        .map_err(err)?;
    Ok(Json(json!({ "queue": queue })))
}

#[derive(Debug, Deserialize)]
pub struct QueueMemberRequest {
    pub advisor_id: String,
    #[serde(default)]
    pub is_supervisor: bool,
}

pub async fn add_queue_member(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(queue_id): Path<String>,
    Json(req): Json<QueueMemberRequest>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    state
        .store
        .add_queue_member(&queue_id, &req.advisor_id, req.is_supervisor)
        .map_err(err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_advisors(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authed_advisor(&state, &headers)?;
    let advisors = state.store.list_advisors().map_err(err)?;
    Ok(Json(json!({ "advisors": advisors })))
}

#[derive(Debug, Deserialize)]
pub struct CreateAdvisorRequest {
    pub username: String,
    pub display_name: String,
    pub role: AdvisorRole,
    pub password: String,
}

pub async fn create_advisor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateAdvisorRequest>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let advisor = state
        .store
        .create_advisor(&req.username, &req.display_name, req.role, &req.password)
        .map_err(err)?;
    Ok(Json(json!({ "advisor": advisor })))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status_id: Option<String>,
    pub manually_offline: Option<bool>,
}

pub async fn set_advisor_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(advisor_id): Path<String>,
    Json(req): Json<SetStatusRequest>,
) -> ApiResult {
    let caller = authed_advisor(&state, &headers)?;
    if caller.id != advisor_id && caller.role == AdvisorRole::Advisor {
        return Err(err(chasqui_core::ChasquiError::Auth(
            "cannot change another advisor's status".into(),
        )));
    }
    if let Some(status_id) = &req.status_id {
        state
            .store
            .set_advisor_status(&advisor_id, status_id)
            .map_err(err)?;
    }
    if let Some(offline) = req.manually_offline {
        state
            .store
            .set_manually_offline(&advisor_id, offline)
            .map_err(err)?;
    }
    // Status flips can unlock or drain assignment.
    state
        .queue
        .handle()
        .trigger(chasqui_queue::QueueTrigger::AdvisorStatusChanged { advisor_id });
    Ok(Json(json!({ "ok": true })))
}

fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let advisor = authed_advisor(state, headers)?;
    if advisor.role == AdvisorRole::Advisor {
        return Err(err(chasqui_core::ChasquiError::Auth(
            "admin or supervisor role required".into(),
        )));
    }
    Ok(())
}
