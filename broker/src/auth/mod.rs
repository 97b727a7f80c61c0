//! Thin admin-auth shim: a login endpoint and a bearer-checking middleware
//! guarding `/api/*` (§4.8).

pub mod session;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(rename = "expiresIn")]
    pub expires_in: u64,
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    if body.password != state.config.admin_password {
        return Error::Unauthenticated.into_response();
    }

    match session::create_session_token(&state.config) {
        Ok(token) => {
            let expires_in = state.config.token_lifetime.as_secs();
            Json(LoginResponse { token, expires_in }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Rejects requests to protected admin endpoints unless auth is disabled
/// or a valid bearer token is present.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.config.require_auth {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if session::verify_session_token(token, &state.config).is_ok() => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "invalid credentials"}))).into_response(),
    }
}
