pub mod auth;
pub mod autonomous;
pub mod chat;
pub mod error;
pub mod execute;
pub mod health;
pub mod schedules;
pub mod sessions;
pub mod tools;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Two surfaces share it: the session-less executor surface (`/execute`,
/// `/task`, `/tools`, `/files`) and the engagement surface under `/api`
/// plus the session websocket.
pub fn router() -> Router<AppState> {
    Router::new()
        // ── Executor surface ─────────────────────────────────────────
        .route("/health", get(health::toolbox_health))
        .route("/execute", post(execute::execute))
        .route("/execute/sync", post(execute::execute_sync))
        .route("/tasks", get(execute::list_tasks))
        .route("/task/:id", get(execute::get_task))
        .route("/task/:id/kill", post(execute::kill_task))
        .route("/ws/task/:id", get(execute::task_stream_ws))
        .route("/files/*path", get(execute::read_artifact))
        .route("/tools", get(tools::list_tools))
        .route(
            "/tools/definitions",
            get(tools::list_definitions).post(tools::create_definition),
        )
        .route(
            "/tools/definitions/:name",
            get(tools::get_definition)
                .put(tools::update_definition)
                .delete(tools::delete_definition),
        )
        // ── Engagement surface ───────────────────────────────────────
        .route("/api/health", get(health::api_health))
        .route(
            "/api/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/api/sessions/:id",
            get(sessions::get_session)
                .put(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route("/api/tools/execute", post(execute::session_execute))
        .route(
            "/api/tools/execute/bash",
            post(execute::session_execute_bash),
        )
        .route("/api/chat", post(chat::chat))
        .route("/api/autonomous/start", post(autonomous::start))
        .route("/api/autonomous/stop", post(autonomous::stop))
        .route("/api/autonomous/approve", post(autonomous::approve))
        .route("/api/autonomous/scope", post(autonomous::scope_decision))
        .route(
            "/api/schedules",
            post(schedules::create_schedule).get(schedules::list_schedules),
        )
        .route(
            "/api/schedules/:id",
            get(schedules::get_schedule)
                .put(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route("/api/schedules/:id/enable", post(schedules::enable_schedule))
        .route(
            "/api/schedules/:id/disable",
            post(schedules::disable_schedule),
        )
        .route("/api/schedules/:id/run", post(schedules::run_schedule_now))
        // ── Session event stream ─────────────────────────────────────
        .route("/ws/:session_id", get(ws::session_ws))
}
