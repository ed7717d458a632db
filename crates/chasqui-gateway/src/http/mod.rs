pub mod api;
pub mod connections;
pub mod reports;
pub mod toon;
pub mod webhook;

use axum::{http::StatusCode, Json};
use chasqui_core::ChasquiError;
use serde_json::{json, Value};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "chasqui-gateway" }))
}

/// Map the platform error taxonomy onto HTTP statuses.
pub fn error_response(e: ChasquiError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        ChasquiError::Auth(_) => StatusCode::UNAUTHORIZED,
        ChasquiError::Validation(_) | ChasquiError::Serialization(_) => StatusCode::BAD_REQUEST,
        ChasquiError::NotFound(_) => StatusCode::NOT_FOUND,
        ChasquiError::Conflict(_) => StatusCode::CONFLICT,
        ChasquiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ChasquiError::Upstream { .. } | ChasquiError::Network(_) => StatusCode::BAD_GATEWAY,
        ChasquiError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        ChasquiError::Config(_) | ChasquiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": e.to_string(), "code": e.code() })),
    )
}
