//! Admin HTTP surface — dashboard queries and the operator override command.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OverrideError;
use crate::model::OverrideAction;
use crate::observe::Observer;
use crate::pipeline::OverrideStore;
use crate::store::{DashboardStore, OperationalStore};

/// Default rolling window for daily stats.
const DEFAULT_DAYS: u32 = 7;
const MAX_DAYS: u32 = 365;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub overrides: Arc<OverrideStore>,
    pub store: Arc<dyn OperationalStore>,
    /// None when the dashboard store is disabled.
    pub dashboard: Option<Arc<dyn DashboardStore>>,
    pub observer: Arc<Observer>,
}

/// Build the admin router.
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/stats/daily", get(daily_stats))
        .route("/api/stats/api-calls", get(api_call_stats))
        .route("/api/threads/{id}/messages", get(thread_messages))
        .route("/api/threads/{id}/pending", get(thread_pending))
        .route("/api/pending/{id}/override", post(override_message))
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    let message: String = message.into();
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": message })),
    )
}

fn dashboard_disabled() -> (StatusCode, Json<serde_json::Value>) {
    error(StatusCode::SERVICE_UNAVAILABLE, "Dashboard store disabled")
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-pilot",
        "counters": state.observer.snapshot(),
    }))
}

// ── Queries ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WindowQuery {
    days: Option<u32>,
}

impl WindowQuery {
    fn days(&self) -> u32 {
        self.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS)
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let Some(dashboard) = &state.dashboard else {
        return dashboard_disabled();
    };
    match dashboard.totals().await {
        Ok(totals) => (StatusCode::OK, Json(serde_json::json!(totals))),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn daily_stats(
    State(state): State<AppState>,
    Query(window): Query<WindowQuery>,
) -> impl IntoResponse {
    let Some(dashboard) = &state.dashboard else {
        return dashboard_disabled();
    };
    match dashboard.daily_counts(window.days()).await {
        Ok(days) => (StatusCode::OK, Json(serde_json::json!(days))),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn api_call_stats(
    State(state): State<AppState>,
    Query(window): Query<WindowQuery>,
) -> impl IntoResponse {
    let Some(dashboard) = &state.dashboard else {
        return dashboard_disabled();
    };
    match dashboard.api_calls(window.days()).await {
        Ok(calls) => (StatusCode::OK, Json(serde_json::json!(calls))),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(dashboard) = &state.dashboard else {
        return dashboard_disabled();
    };
    match dashboard.thread_history(&id).await {
        Ok(history) => (StatusCode::OK, Json(serde_json::json!(history))),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn thread_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.overrides.pending_for_thread(&id).await {
        Ok(replies) => (StatusCode::OK, Json(serde_json::json!(replies))),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ── Commands ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    text: String,
}

/// The only external mutation: replace a pending reply or suspend it.
async fn override_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OverrideRequest>,
) -> impl IntoResponse {
    let Ok(reply_id) = Uuid::parse_str(&id) else {
        return error(StatusCode::BAD_REQUEST, "Invalid pending reply ID");
    };

    let action = OverrideAction::from_text(&body.text);
    let updated = match state.overrides.apply(reply_id, action).await {
        Ok(reply) => reply,
        Err(e) => {
            let status = match &e {
                OverrideError::NotFound(_) => StatusCode::NOT_FOUND,
                OverrideError::Conflict { .. } => StatusCode::CONFLICT,
                OverrideError::InvalidState { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(reply_id = %reply_id, error = %e, "Override rejected");
            return error(status, e.to_string());
        }
    };

    // Mirror the thread status change for the dashboard.
    if let Some(dashboard) = &state.dashboard
        && let Ok(Some(thread)) = state.store.get_thread(&updated.thread_id).await
        && let Err(e) = dashboard.record_thread(&thread).await
    {
        warn!(thread_id = %thread.id, "Dashboard thread update failed: {e}");
    }

    info!(reply_id = %reply_id, state = %updated.state, "Override accepted");
    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "reply": updated })),
    )
}
