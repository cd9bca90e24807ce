//! Relay error type with its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Room id should be uuid")]
    InvalidRoomId,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Room is full")]
    RoomFull,
}

/// JSON error body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    details: String,
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRoomId => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RoomNotFound => StatusCode::NOT_FOUND,
            Self::RoomFull => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            details: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
