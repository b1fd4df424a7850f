//! Schedule CRUD and lifecycle endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::api::error::api_error;
use crate::runtime::schedule_runner;
use crate::runtime::schedules::{validate_cron, JobStatus, ScheduleType, ScheduledJob};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub session_id: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn validate_trigger(
    schedule_type: ScheduleType,
    run_at: &Option<DateTime<Utc>>,
    cron_expr: &Option<String>,
) -> Result<(), String> {
    match schedule_type {
        ScheduleType::Once => {
            if run_at.is_none() {
                return Err("one-shot schedules require run_at".into());
            }
        }
        ScheduleType::Cron => {
            let Some(expr) = cron_expr else {
                return Err("cron schedules require cron_expr".into());
            };
            validate_cron(expr)?;
        }
    }
    Ok(())
}

/// POST /api/schedules
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Response {
    if state.sessions.get(&req.session_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    }
    if !state.tools.contains(&req.tool) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown tool: {}", req.tool),
        );
    }
    if let Err(reason) = validate_trigger(req.schedule_type, &req.run_at, &req.cron_expr) {
        return api_error(StatusCode::BAD_REQUEST, reason);
    }

    let job = state.jobs.insert(ScheduledJob::new(
        req.session_id,
        req.tool,
        req.parameters,
        req.schedule_type,
        req.run_at,
        req.cron_expr,
        req.timezone,
        req.label,
        req.created_by,
    ));
    Json(job).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// GET /api/schedules
pub async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let jobs = match query.session_id {
        Some(sid) => state.jobs.list_for_session(&sid),
        None => state.jobs.list(),
    };
    Json(jobs).into_response()
}

/// GET /api/schedules/{id}
pub async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.jobs.get(&id) {
        Some(job) => Json(job).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Schedule not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// PUT /api/schedules/{id} — updating the trigger re-arms it.
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Response {
    let Some(job) = state.jobs.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "Schedule not found");
    };

    let run_at = req.run_at.or(job.run_at);
    let cron_expr = req.cron_expr.clone().or(job.cron_expr.clone());
    if let Err(reason) = validate_trigger(job.schedule_type, &run_at, &cron_expr) {
        return api_error(StatusCode::BAD_REQUEST, reason);
    }

    let updated = state.jobs.update(&id, |j| {
        if let Some(parameters) = req.parameters {
            j.parameters = parameters;
        }
        if let Some(label) = req.label {
            j.label = label;
        }
        if let Some(timezone) = req.timezone {
            j.timezone = Some(timezone);
        }
        j.run_at = run_at;
        j.cron_expr = cron_expr;
        j.next_run = j.compute_next_run(&Utc::now());
    });
    Json(updated).into_response()
}

/// DELETE /api/schedules/{id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    if state.jobs.delete(&id) {
        Json(json!({ "status": "deleted" })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "Schedule not found")
    }
}

/// POST /api/schedules/{id}/enable
pub async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.jobs.update(&id, |j| {
        j.status = JobStatus::Scheduled;
        j.next_run = j.compute_next_run(&Utc::now());
    }) {
        Some(job) => Json(job).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Schedule not found"),
    }
}

/// POST /api/schedules/{id}/disable — pauses the trigger.
pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.jobs.update(&id, |j| j.status = JobStatus::Disabled) {
        Some(job) => Json(job).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Schedule not found"),
    }
}

/// POST /api/schedules/{id}/run — re-arm a terminal/disabled job and fire
/// it immediately.
pub async fn run_schedule_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(job) = state.jobs.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "Schedule not found");
    };
    if job.status == JobStatus::Running {
        return api_error(StatusCode::BAD_REQUEST, "schedule is already running");
    }
    schedule_runner::run_now(&state, &job);
    Json(json!({ "status": "triggered", "id": id })).into_response()
}
