//! HTTP request handlers.

use crate::methods::RunAppMethodInput;
use crate::server::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `POST /api/internal/rpc/RunAppMethod`: the daemon's result as the body,
/// or `500 {type:"error", error}`.
pub async fn handle_run_app_method(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let input: RunAppMethodInput = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => return error_response(format!("invalid request body: {}", e)),
    };

    debug!(
        "RunAppMethod {}: {}.{}",
        input.app_id, input.server_file, input.method_name
    );
    match state
        .supervisor
        .run_method(
            &input.app_id,
            &input.server_file,
            &input.method_name,
            input.data,
        )
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            error!("RunAppMethod failed for {}: {}", input.app_id, e);
            error_response(e.to_string())
        }
    }
}

fn error_response(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"type": "error", "error": message})),
    )
        .into_response()
}
