//! Session CRUD endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use tal_tools::command::build_bash_command;
use tal_tools::ExecSpec;

use crate::api::error::api_error;
use crate::runtime::events::EventKind;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub target_scope: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    let handle = state
        .sessions
        .create(req.name, req.target_scope, req.notes, req.client_id);
    Json(handle.read(|s| s.summary())).into_response()
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.sessions.list()).into_response()
}

/// GET /api/sessions/{id}
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.get(&id) {
        Some(handle) => Json(handle.read(|s| s.summary())).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Session not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub name: Option<String>,
    pub target_scope: Option<Vec<String>>,
    pub notes: Option<String>,
}

/// PUT /api/sessions/{id}
pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> Response {
    let Some(handle) = state.sessions.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };

    let scope_change = handle.mutate(|s| {
        if let Some(name) = req.name {
            s.name = name;
        }
        if let Some(notes) = req.notes {
            s.notes = notes;
        }
        if let Some(scope) = req.target_scope {
            let added: Vec<String> = scope
                .iter()
                .filter(|e| !s.target_scope.contains(e))
                .cloned()
                .collect();
            s.target_scope = scope;
            Some((added, s.target_scope.clone()))
        } else {
            None
        }
    });

    if let Some((added, target_scope)) = scope_change {
        state.bus.broadcast(
            &id,
            EventKind::ScopeUpdated {
                added,
                target_scope,
                reason: None,
            },
        );
    }
    Json(handle.read(|s| s.summary())).into_response()
}

/// DELETE /api/sessions/{id} — removes the session and best-effort cleans
/// the per-task artifact directories through the executor.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(task_ids) = state.sessions.delete(&id) else {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    };

    if !task_ids.is_empty() {
        let dirs: Vec<String> = task_ids
            .iter()
            .filter(|t| t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            .map(|t| {
                state
                    .executor
                    .artifact_dir()
                    .join(t)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        if !dirs.is_empty() {
            let command = format!("rm -rf {} 2>/dev/null; echo done", dirs.join(" "));
            let cleanup_id = format!("cleanup-{}", &id[..id.len().min(8)]);
            state.executor.submit(
                &cleanup_id,
                ExecSpec {
                    tool: "bash".into(),
                    command_line: build_bash_command(&command),
                    display_command: command,
                    timeout: std::time::Duration::from_secs(10),
                },
            );
        }
    }

    Json(json!({ "status": "deleted" })).into_response()
}
