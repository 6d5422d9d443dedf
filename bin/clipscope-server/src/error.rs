//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body
//! `{"error": "..."}` with a matching status code.
//!
//! Internal errors are logged with full detail but only a generic message is
//! returned, so storage paths and collaborator output never reach clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use clipscope_core::{RuntimeError, StorageError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration core.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller referenced a job that does not exist (or was evicted).
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.clone()),

            ServerError::Runtime(e) => match e {
                RuntimeError::JobNotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
                RuntimeError::Storage(StorageError::NotFound { kind, .. }) => {
                    (StatusCode::NOT_FOUND, format!("{kind} not available"))
                }
                RuntimeError::NotComplete { .. } | RuntimeError::NotCancellable { .. } => {
                    (StatusCode::CONFLICT, e.to_string())
                }
                RuntimeError::QueueFull { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "server is busy, try again later".to_owned(),
                ),
                RuntimeError::Shutdown => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "server is shutting down".to_owned(),
                ),
                _ => {
                    error!(error = %e, "runtime error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = self.status_and_message();
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
