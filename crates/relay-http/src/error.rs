//! Error responses for the relay routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_core::session::ProtocolError;
use relay_core::stream::StreamError;
use serde::Serialize;

/// Body of every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// Malformed body or bad field. Nothing was written.
    Validation(String),
    /// The request is well-formed but cannot be served in the current state.
    Precondition(String),
    NotFound(String),
    /// The decision was persisted but no agent accepted it.
    ForwardFailed(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Precondition(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ForwardFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Validation(m)
            | ApiError::Precondition(m)
            | ApiError::NotFound(m)
            | ApiError::ForwardFailed(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NoAgents(_) => ApiError::Precondition(err.to_string()),
            ProtocolError::InvalidRegistration(_)
            | ProtocolError::Stream(StreamError::InvalidSession(_)) => {
                ApiError::Validation(err.to_string())
            }
            ProtocolError::Stream(_) | ProtocolError::Worker(_) => {
                log::error!("Request failed: {}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            success: false,
            error: self.message().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
