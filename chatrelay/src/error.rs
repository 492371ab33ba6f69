//! Relay error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::ConnectionId;

/// Errors surfaced by the relay core and its HTTP handlers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No receive channel is open for the session.
    #[error("no receiver is listening for session '{0}'")]
    SessionNotFound(String),

    /// The sink rejected a write because its peer is gone.
    #[error("connection {0} is closed")]
    TransportWrite(ConnectionId),

    /// An exchange for the session is still streaming.
    #[error("an exchange is already streaming to session '{0}'")]
    ExchangeInProgress(String),

    /// The provider capability check failed.
    #[error("provider API key is not valid")]
    Unauthorized,

    /// The submission is missing something the relay needs.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider failed a non-streaming call.
    #[error("provider request failed: {0}")]
    Upstream(String),

    /// A chunk could not be serialized into a frame.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    /// Short machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::TransportWrite(_) => "transport_write",
            Self::ExchangeInProgress(_) => "exchange_in_progress",
            Self::Unauthorized => "unauthorized",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Upstream(_) => "upstream",
            Self::Encode(_) => "encode",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ExchangeInProgress(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::TransportWrite(_) => StatusCode::GONE,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned for failed calls.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }
        let body = ErrorBody {
            success: false,
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
