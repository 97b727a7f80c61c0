//! Crate-wide error type and its mapping onto the HTTP status table in the
//! external interfaces section of the design.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing or malformed slug")]
    InvalidSlug,

    #[error("slug '{0}' is reserved")]
    ReservedSlug(String),

    #[error("slug '{0}' is not on the whitelist")]
    SlugNotWhitelisted(String),

    #[error("request body exceeds the configured maximum")]
    PayloadTooLarge,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("no active handler for this slug")]
    HandlerLost,

    #[error("no response before deadline")]
    DeadlineExceeded,

    #[error("failed to forward request to handler: {0}")]
    ForwardFailed(String),

    #[error("invalid credentials")]
    Unauthenticated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidSlug | Error::ReservedSlug(_) => StatusCode::BAD_REQUEST,
            Error::SlugNotWhitelisted(_) => StatusCode::FORBIDDEN,
            Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::HandlerLost => StatusCode::SERVICE_UNAVAILABLE,
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::ForwardFailed(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// The exact text the caller sees in the `{"error": ...}` body. Never
    /// leaks internal detail for the server-caused variants.
    pub fn user_message(&self) -> String {
        match self {
            Error::DeadlineExceeded => "No WebSocket client connected within timeout".to_string(),
            Error::HandlerLost => "No active WebSocket client for this slug".to_string(),
            Error::ForwardFailed(_) | Error::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal failure");
        }

        (status, axum::Json(ErrorBody { error: self.user_message() })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
