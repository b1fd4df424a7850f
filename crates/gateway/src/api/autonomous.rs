//! Autonomous-mode control endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::api::error::{api_error, domain_error};
use crate::runtime::agent::AgentDriver;
use crate::runtime::events::EventKind;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub session_id: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub objective: String,
    #[serde(default = "d_steps")]
    pub max_steps: u32,
    /// Skip the human gate and approve every step.
    #[serde(default)]
    pub auto_approve: bool,
    /// Run a playbook instead of the freeform loop.
    #[serde(default)]
    pub playbook_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

fn d_true() -> bool {
    true
}

fn d_steps() -> u32 {
    10
}

/// POST /api/autonomous/start
pub async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    let Some(handle) = state.sessions.get(&req.session_id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };
    if !req.enabled {
        return stop_session(&state, &req.session_id);
    }
    if handle.read(|s| s.auto.auto_mode) {
        return api_error(StatusCode::BAD_REQUEST, "autonomous mode already running");
    }

    let playbook = match &req.playbook_id {
        Some(id) => match state.playbooks.get(id) {
            Some(pb) => Some(pb),
            None => return api_error(StatusCode::NOT_FOUND, format!("Unknown playbook: {id}")),
        },
        None => None,
    };

    // A playbook's step budget is the sum of its phase budgets.
    let max_steps = playbook
        .as_ref()
        .map(|pb| pb.phases.iter().map(|p| p.max_steps).sum())
        .unwrap_or(req.max_steps)
        .max(1);

    handle.mutate_volatile(|s| {
        s.begin_autonomous(req.objective.clone(), max_steps, req.auto_approve)
    });

    let driver = match AgentDriver::new(state.clone(), &req.session_id, req.user) {
        Ok(driver) => driver,
        Err(e) => return domain_error(&e),
    };

    // Announce the mode change before the loop can emit its first status.
    state.bus.broadcast(
        &req.session_id,
        EventKind::AutoModeChanged {
            enabled: true,
            objective: Some(req.objective),
            max_steps: Some(max_steps),
        },
    );

    match playbook {
        Some(pb) => {
            tokio::spawn(driver.run_playbook(pb));
        }
        None => {
            tokio::spawn(driver.run_autonomous());
        }
    }
    Json(json!({ "status": "started" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

/// POST /api/autonomous/stop
pub async fn stop(State(state): State<AppState>, Json(req): Json<StopRequest>) -> Response {
    if state.sessions.get(&req.session_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    }
    stop_session(&state, &req.session_id)
}

fn stop_session(state: &AppState, session_id: &str) -> Response {
    if let Some(handle) = state.sessions.get(session_id) {
        handle.mutate_volatile(|s| s.stop_autonomous());
    }
    state.bus.broadcast(
        session_id,
        EventKind::AutoModeChanged {
            enabled: false,
            objective: None,
            max_steps: None,
        },
    );
    Json(json!({ "status": "stopped" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub session_id: String,
    pub approved: bool,
    pub step_id: String,
}

/// POST /api/autonomous/approve — resolve the pending step gate. The first
/// decision wins; repeats and unknown step ids get a 404.
pub async fn approve(State(state): State<AppState>, Json(req): Json<ApproveRequest>) -> Response {
    let Some(handle) = state.sessions.get(&req.session_id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };

    let resolved = handle.mutate_volatile(|s| s.resolve_approval(&req.step_id, req.approved));
    if !resolved {
        return api_error(StatusCode::NOT_FOUND, "No pending approval found");
    }

    state.bus.broadcast(
        &req.session_id,
        EventKind::AutoStepDecision {
            step_id: req.step_id,
            approved: req.approved,
        },
    );
    Json(json!({ "status": if req.approved { "approved" } else { "rejected" } }))
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ScopeDecisionRequest {
    pub session_id: String,
    pub approval_id: String,
    pub approved: bool,
}

/// POST /api/autonomous/scope — resolve a pending scope-addition request.
/// The waiting agent performs the merge and broadcasts `scope_updated`.
pub async fn scope_decision(
    State(state): State<AppState>,
    Json(req): Json<ScopeDecisionRequest>,
) -> Response {
    let Some(handle) = state.sessions.get(&req.session_id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };
    let resolved =
        handle.mutate_volatile(|s| s.resolve_scope_approval(&req.approval_id, req.approved));
    if !resolved {
        return api_error(StatusCode::NOT_FOUND, "No pending scope approval found");
    }
    Json(json!({ "status": if req.approved { "approved" } else { "rejected" } }))
        .into_response()
}
