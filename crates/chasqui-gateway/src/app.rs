use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    routing::{get, post},
    Router,
};
use chasqui_core::config::ChasquiConfig;
use chasqui_core::secrets::SecretStore;
use chasqui_engine::FlowRuntime;
use chasqui_flows::FlowCatalog;
use chasqui_queue::QueueEngine;
use chasqui_sessions::SessionStore;
use chasqui_store::Store;
use chasqui_wire::CloudApiClient;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};

/// Central shared state, passed as Arc<AppState> to every handler.
pub struct AppState {
    pub config: ChasquiConfig,
    pub secrets: SecretStore,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionStore>,
    pub catalog: Arc<FlowCatalog>,
    pub engine: Arc<FlowRuntime>,
    pub queue: Arc<QueueEngine>,
    pub wire: Arc<CloudApiClient>,
    /// Ordered delivery path, shared with the engine.
    pub sender: Arc<dyn chasqui_engine::OutboundSender>,
    pub event_seq: AtomicU64,
    /// Active WS clients: client_id → handle.
    pub ws_clients: DashMap<String, crate::ws::ClientHandle>,
    /// Operator API tokens: token → advisor id.
    pub api_tokens: DashMap<String, String>,
    /// Per-channel ingress backpressure; exhausted permits → 429.
    pub ingress: DashMap<String, Arc<Semaphore>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChasquiConfig,
        secrets: SecretStore,
        store: Arc<Store>,
        sessions: Arc<SessionStore>,
        catalog: Arc<FlowCatalog>,
        engine: Arc<FlowRuntime>,
        queue: Arc<QueueEngine>,
        wire: Arc<CloudApiClient>,
        sender: Arc<dyn chasqui_engine::OutboundSender>,
    ) -> Self {
        Self {
            config,
            secrets,
            store,
            sessions,
            catalog,
            engine,
            queue,
            wire,
            sender,
            event_seq: AtomicU64::new(0),
            ws_clients: DashMap::new(),
            api_tokens: DashMap::new(),
            ingress: DashMap::new(),
        }
    }

    /// Monotonically increasing sequence for published WS events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-WS-client outbound item.
pub enum WsOut {
    Frame(String),
    Close { code: u16, reason: String },
}

pub type WsSender = mpsc::Sender<WsOut>;

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health))
        .route(
            "/webhook/whatsapp",
            get(crate::http::webhook::verify_handler).post(crate::http::webhook::inbound_handler),
        )
        .route("/webhook/flows/{conversation_id}", post(crate::http::webhook::flow_correlate_handler))
        .route("/api/auth/login", post(crate::auth::login_handler))
        .route("/api/auth/logout", post(crate::auth::logout_handler))
        .route("/api/conversations", get(crate::http::api::list_conversations))
        .route(
            "/api/conversations/{id}/messages",
            get(crate::http::api::list_messages),
        )
        .route(
            "/api/conversations/{id}/attachments",
            get(crate::http::api::list_attachments),
        )
        .route("/api/conversations/{id}/accept", post(crate::http::api::accept))
        .route("/api/conversations/{id}/transfer", post(crate::http::api::transfer))
        .route("/api/conversations/{id}/release", post(crate::http::api::release))
        .route("/api/conversations/{id}/close", post(crate::http::api::close))
        .route("/api/conversations/{id}/send", post(crate::http::api::send_message))
        .route(
            "/api/messages/{id}/attachments",
            post(crate::http::api::upload_attachment),
        )
        .route("/api/queues", get(crate::http::api::list_queues).post(crate::http::api::create_queue))
        .route(
            "/api/queues/{id}/members",
            post(crate::http::api::add_queue_member),
        )
        .route(
            "/api/advisors",
            get(crate::http::api::list_advisors).post(crate::http::api::create_advisor),
        )
        .route(
            "/api/advisors/{id}/status",
            post(crate::http::api::set_advisor_status),
        )
        .route(
            "/api/connections/whatsapp/list",
            get(crate::http::connections::list),
        )
        .route(
            "/api/connections/whatsapp/save",
            post(crate::http::connections::save),
        )
        .route(
            "/api/connections/whatsapp/check",
            post(crate::http::connections::check),
        )
        .route(
            "/api/connections/whatsapp/test",
            post(crate::http::connections::test),
        )
        .route(
            "/api/connections/whatsapp/{id}/verify",
            get(crate::http::connections::verify),
        )
        .route("/api/reports/ai/daily", get(crate::http::reports::daily))
        .route("/api/reports/ai/weekly", get(crate::http::reports::weekly))
        .route(
            "/api/reports/ai/performance",
            get(crate::http::reports::performance),
        )
        .route("/api/reports/ai/problems", get(crate::http::reports::problems))
        .route("/api/crm/ws", get(crate::ws::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
