//! Chat endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::api::error::{api_error, domain_error};
use crate::runtime::agent::AgentDriver;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// POST /api/chat — one chat-mode agent turn.
///
/// While an autonomous step approval is pending, operator messages are
/// queued instead; the autonomous loop drains them into conversational
/// replies during the gate.
pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(handle) = state.sessions.get(&req.session_id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };

    let queued = handle.mutate_volatile(|s| {
        let gated = s.auto.auto_mode
            && s.auto
                .pending_approval
                .as_ref()
                .map_or(false, |p| !p.resolved);
        if gated {
            s.auto.operator_queue.push_back(req.message.clone());
        }
        gated
    });
    if queued {
        return Json(json!({ "queued": true })).into_response();
    }

    let driver = match AgentDriver::new(state.clone(), &req.session_id, req.user) {
        Ok(driver) => driver,
        Err(e) => return domain_error(&e),
    };
    match driver.chat(&req.message).await {
        Ok(outcome) => Json(json!({
            "content": outcome.content,
            "tool_calls": outcome.tool_calls,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(session_id = %req.session_id, error = %e, "chat turn failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
