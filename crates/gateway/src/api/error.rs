//! Shared API error shape: `{ "error": "<message>" }` with a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use tal_domain::Error;

/// Build a standardized JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error to the appropriate status code.
pub fn domain_error(e: &Error) -> Response {
    let status = match e {
        Error::SessionNotFound(_) | Error::TaskNotFound(_) | Error::ToolNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::InvalidInput(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}
