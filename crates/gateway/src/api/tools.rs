//! Tool-definition catalog endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use tal_tools::ToolDefinition;

use crate::api::error::{api_error, domain_error};
use crate::state::AppState;

/// GET /tools — name-keyed catalog summary.
pub async fn list_tools(State(state): State<AppState>) -> Response {
    let tools: serde_json::Map<String, serde_json::Value> = state
        .tools
        .list()
        .into_iter()
        .map(|d| {
            (
                d.name.clone(),
                json!({
                    "name": d.name,
                    "description": d.description,
                    "category": d.category,
                    "risk_level": d.risk_level,
                    "parameters": d.parameters,
                }),
            )
        })
        .collect();
    Json(json!({ "tools": tools })).into_response()
}

/// GET /tools/definitions — full definitions.
pub async fn list_definitions(State(state): State<AppState>) -> Response {
    let tools: serde_json::Map<String, serde_json::Value> = state
        .tools
        .list()
        .into_iter()
        .map(|d| (d.name.clone(), serde_json::to_value(&d).unwrap_or_default()))
        .collect();
    Json(json!({ "tools": tools })).into_response()
}

/// GET /tools/definitions/{name}
pub async fn get_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.tools.get(&name) {
        Some(def) => Json(def).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("Unknown tool: {name}")),
    }
}

/// POST /tools/definitions
pub async fn create_definition(
    State(state): State<AppState>,
    Json(def): Json<ToolDefinition>,
) -> Response {
    let name = def.name.clone();
    match state.tools.insert(def) {
        Ok(()) => Json(json!({ "status": "created", "name": name })).into_response(),
        Err(e) => domain_error(&e),
    }
}

/// PUT /tools/definitions/{name}
pub async fn update_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(def): Json<ToolDefinition>,
) -> Response {
    match state.tools.update(&name, def) {
        Ok(()) => Json(json!({ "status": "updated", "name": name })).into_response(),
        Err(e) => domain_error(&e),
    }
}

/// DELETE /tools/definitions/{name}
pub async fn delete_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.tools.remove(&name) {
        Ok(()) => Json(json!({ "status": "deleted", "name": name })).into_response(),
        Err(e) => domain_error(&e),
    }
}
