//! HTTP handlers.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use factlog_store::FactLog;
use serde::Serialize;
use serde_json::{json, Value};

use crate::AppState;

/// Errors returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Health check handler.
///
/// Returns `200 OK` with server status and version.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Serialize)]
pub struct SerialResponse {
    pub serial: i64,
}

/// Handler for `GET /api/facts/serial`: the serial of the newest fact.
pub async fn highest_serial_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<SerialResponse>, ApiError> {
    let serial = tokio::task::spawn_blocking(move || state.store.highest_serial())
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {e}")))?
        .map_err(|e| {
            tracing::error!(error = %e, "failed to read highest serial");
            ApiError::InternalServerError(e.to_string())
        })?;

    Ok(Json(SerialResponse { serial }))
}
