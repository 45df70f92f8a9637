//! Application error types and Axum response conversion.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cotflow_core::ChatError;
use serde::Serialize;

/// Application-level errors with HTTP status code mapping.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Chat(ChatError),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        AppError::Chat(err)
    }
}

fn chat_status(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
        ChatError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::Network(_) | ChatError::StreamProtocol(_) => StatusCode::BAD_GATEWAY,
        ChatError::TurnInProgress => StatusCode::CONFLICT,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, kind) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Chat(err) => (chat_status(&err), err.to_string(), Some(err.kind())),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };
        (status, Json(ErrorResponse { error, kind })).into_response()
    }
}
