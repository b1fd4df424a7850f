//! Health probes.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::AppState;

/// GET /health — executor surface probe.
pub async fn toolbox_health(State(state): State<AppState>) -> Response {
    Json(json!({ "status": "ok", "tools": state.tools.names() })).into_response()
}

/// GET /api/health — gateway probe.
pub async fn api_health(State(state): State<AppState>) -> Response {
    let ai_configured = std::env::var(&state.config.llm.api_key_env)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    Json(json!({
        "status": "ok",
        "toolbox": "connected",
        "tool_count": state.tools.names().len(),
        "session_count": state.sessions.list().len(),
        "ai_configured": ai_configured,
    }))
    .into_response()
}
