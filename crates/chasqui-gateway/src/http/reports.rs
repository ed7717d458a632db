//! AI report endpoints. Text payloads in the TOON shape; the downstream
//! report assistant parses them mechanically.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use axum::Json;
use chasqui_core::types::now_millis;

use crate::app::AppState;
use crate::auth::authed_advisor;
use crate::http::toon::ToonWriter;

type TextResult = Result<String, (StatusCode, Json<serde_json::Value>)>;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

pub async fn daily(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TextResult {
    authed_advisor(&state, &headers)?;
    render_period(&state, "daily", now_millis() - DAY_MS)
}

pub async fn weekly(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TextResult {
    authed_advisor(&state, &headers)?;
    render_period(&state, "weekly", now_millis() - 7 * DAY_MS)
}

pub async fn performance(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TextResult {
    authed_advisor(&state, &headers)?;
    let since = now_millis() - DAY_MS;
    let advisors = state.store.advisor_report(since).map_err(internal)?;

    let mut w = ToonWriter::new();
    w.kv("report", "performance")
        .kv("timezone", &state.config.locale.timezone_name)
        .kv("window_hours", 24)
        .blank()
        .table(
            "advisors",
            &["advisor", "online", "attending", "accepted_24h"],
            &advisors
                .iter()
                .map(|a| {
                    vec![
                        a.display_name.clone(),
                        a.online.to_string(),
                        a.attending.to_string(),
                        a.accepted_since.to_string(),
                    ]
                })
                .collect::<Vec<_>>(),
        );
    Ok(w.finish())
}

pub async fn problems(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TextResult {
    authed_advisor(&state, &headers)?;
    let since = now_millis() - DAY_MS;
    let counts = state.store.report_counts(since).map_err(internal)?;
    let divergent = state.store.count_bot_divergent().map_err(internal)?;

    let mut problems: Vec<Vec<String>> = Vec::new();
    if counts.failed_since > 0 {
        problems.push(vec![
            "failed_sends".into(),
            counts.failed_since.to_string(),
            "mensajes salientes marcados failed en 24h".into(),
        ]);
    }
    if divergent > 0 {
        problems.push(vec![
            "bot_divergence".into(),
            divergent.to_string(),
            "conversaciones con señales de bot inconsistentes".into(),
        ]);
    }
    if counts.queued > 50 {
        problems.push(vec![
            "queue_backlog".into(),
            counts.queued.to_string(),
            "conversaciones esperando asesor".into(),
        ]);
    }

    let mut w = ToonWriter::new();
    w.kv("report", "problems")
        .kv("generated_at", now_millis())
        .blank()
        .table("problems", &["kind", "count", "detail"], &problems);
    Ok(w.finish())
}

fn render_period(state: &AppState, name: &str, since_ms: i64) -> TextResult {
    let counts = state.store.report_counts(since_ms).map_err(internal)?;
    let advisors = state.store.advisor_report(since_ms).map_err(internal)?;
    let rag = state.store.rag_totals(since_ms).map_err(internal)?;

    let mut w = ToonWriter::new();
    w.kv("report", name)
        .kv("timezone", &state.config.locale.timezone_name)
        .kv("conversations_total", counts.total)
        .kv("conversations_active", counts.active)
        .kv("conversations_attending", counts.attending)
        .kv("conversations_queued", counts.queued)
        .kv("conversations_bot", counts.bot_owned)
        .kv("closed_in_window", counts.closed_since)
        .kv("messages_in", counts.inbound_since)
        .kv("messages_out", counts.outbound_since)
        .kv("messages_failed", counts.failed_since)
        .blank()
        .table(
            "advisors",
            &["advisor", "online", "attending", "accepted"],
            &advisors
                .iter()
                .map(|a| {
                    vec![
                        a.display_name.clone(),
                        a.online.to_string(),
                        a.attending.to_string(),
                        a.accepted_since.to_string(),
                    ]
                })
                .collect::<Vec<_>>(),
        )
        .blank()
        .kv("rag_searches", rag.searches)
        .kv("rag_hits", rag.hits)
        .kv("rag_cost_usd", format!("{:.4}", rag.cost_usd));
    Ok(w.finish())
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}
