//! Tool execution endpoints: the session-less executor surface and the
//! session-scoped execution endpoints, plus the task output websocket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use tal_tools::command::{build_bash_command, build_command};
use tal_tools::{ExecSpec, BASH_TOOL};

use crate::api::error::{api_error, domain_error};
use crate::runtime::pipeline::{self, ExecError, RunRequest};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Render an executor spec from a raw request (no session, no vault).
fn render_spec(state: &AppState, req: &ExecuteRequest) -> Result<ExecSpec, Response> {
    let timeout = Duration::from_secs(
        req.timeout
            .unwrap_or(state.config.exec.default_timeout_sec),
    );
    if req.tool == BASH_TOOL {
        let command = req
            .parameters
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if command.is_empty() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "bash requires a 'command' parameter",
            ));
        }
        return Ok(ExecSpec {
            tool: BASH_TOOL.into(),
            command_line: build_bash_command(&command),
            display_command: command,
            timeout,
        });
    }

    let def = state.tools.get(&req.tool).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Unknown tool: {}", req.tool),
        )
    })?;
    let command_line = build_command(&def, &req.parameters);
    let display_command = command_line.display();
    Ok(ExecSpec {
        tool: req.tool.clone(),
        command_line,
        display_command,
        timeout,
    })
}

/// POST /execute — fire-and-forget.
pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    let spec = match render_spec(&state, &req) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    let task_id = req.task_id.clone().unwrap_or_else(tal_sessions::tiny_id);
    let command = spec.display_command.clone();
    state.executor.submit(&task_id, spec);
    Json(json!({ "task_id": task_id, "command": command, "status": "started" })).into_response()
}

/// POST /execute/sync — block until the terminal state.
pub async fn execute_sync(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    let spec = match render_spec(&state, &req) {
        Ok(spec) => spec,
        Err(resp) => return resp,
    };
    let task_id = req.task_id.clone().unwrap_or_else(tal_sessions::tiny_id);
    let snapshot = state.executor.run_sync(&task_id, spec).await;
    Json(snapshot).into_response()
}

/// GET /task/{id}
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.tasks.get(&id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Task not found"),
    }
}

/// GET /tasks
pub async fn list_tasks(State(state): State<AppState>) -> Response {
    Json(json!({ "tasks": state.tasks.list() })).into_response()
}

/// POST /task/{id}/kill
pub async fn kill_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.executor.kill(&id) {
        return Json(json!({ "status": "killed", "task_id": id })).into_response();
    }
    match state.tasks.get(&id) {
        Some(snapshot) => {
            Json(json!({ "status": snapshot.status, "task_id": id })).into_response()
        }
        None => api_error(StatusCode::NOT_FOUND, "Task not found"),
    }
}

/// GET /files/{path} — read a tool artifact.
pub async fn read_artifact(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Response {
    let rel = std::path::Path::new(&path);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return api_error(StatusCode::BAD_REQUEST, "invalid path");
    }
    let full = state.executor.artifact_dir().join(rel);
    match std::fs::read_to_string(&full) {
        Ok(content) => Json(json!({ "path": path, "content": content })).into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, "File not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task output websocket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// WS /ws/task/{id} — stream stdout/stderr deltas, ending with `done`.
pub async fn task_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_task(socket, state, id))
}

async fn stream_task(mut socket: WebSocket, state: AppState, task_id: String) {
    let interval = Duration::from_millis(state.config.exec.poll_interval_ms);
    let mut out_offset = 0usize;
    let mut err_offset = 0usize;

    loop {
        let Some(delta) = state.tasks.poll(&task_id, out_offset, err_offset) else {
            let _ = socket
                .send(Message::Text(
                    json!({ "error": "Task not found" }).to_string(),
                ))
                .await;
            break;
        };

        if !delta.stdout.is_empty() {
            let msg = json!({ "type": "stdout", "data": delta.stdout }).to_string();
            if socket.send(Message::Text(msg)).await.is_err() {
                return;
            }
        }
        if !delta.stderr.is_empty() {
            let msg = json!({ "type": "stderr", "data": delta.stderr }).to_string();
            if socket.send(Message::Text(msg)).await.is_err() {
                return;
            }
        }
        out_offset = delta.out_offset;
        err_offset = delta.err_offset;

        if delta.status.is_terminal() {
            let done = json!({
                "type": "done",
                "status": delta.status,
                "return_code": delta.return_code,
            })
            .to_string();
            let _ = socket.send(Message::Text(done)).await;
            break;
        }
        tokio::time::sleep(interval).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session-scoped execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SessionExecRequest {
    pub session_id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionBashRequest {
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn exec_error_response(e: ExecError) -> Response {
    match e {
        ExecError::OutOfScope { target } => api_error(
            StatusCode::FORBIDDEN,
            pipeline::scope_violation_message(&target),
        ),
        ExecError::Domain(e) => domain_error(&e),
    }
}

/// POST /api/tools/execute — async run logged to the session.
pub async fn session_execute(
    State(state): State<AppState>,
    Json(req): Json<SessionExecRequest>,
) -> Response {
    let timeout = Duration::from_secs(
        req.timeout
            .unwrap_or(state.config.exec.default_timeout_sec),
    );
    let run = RunRequest::Tool {
        name: req.tool.clone(),
        parameters: req.parameters,
    };
    match pipeline::execute_for_session_async(&state, &req.session_id, run, None, None, timeout)
    {
        Ok(task_id) => Json(json!({
            "task_id": task_id,
            "status": "started",
            "tool": req.tool,
        }))
        .into_response(),
        Err(e) => exec_error_response(e),
    }
}

/// POST /api/tools/execute/bash — async shell run logged to the session.
pub async fn session_execute_bash(
    State(state): State<AppState>,
    Json(req): Json<SessionBashRequest>,
) -> Response {
    let timeout = Duration::from_secs(
        req.timeout
            .unwrap_or(state.config.exec.default_timeout_sec),
    );
    let run = RunRequest::Bash {
        command: req.command,
    };
    match pipeline::execute_for_session_async(&state, &req.session_id, run, None, None, timeout)
    {
        Ok(task_id) => Json(json!({
            "task_id": task_id,
            "status": "started",
            "tool": BASH_TOOL,
        }))
        .into_response(),
        Err(e) => exec_error_response(e),
    }
}
