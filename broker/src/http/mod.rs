//! The HTTP ingress adapter: router assembly, the brokered `/{slug}`
//! handler, the status/dashboard surface, and the security/CORS header
//! middleware applied to every reply (§6).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::Config;
use crate::control::run_session;
use crate::engine::Engine;
use crate::errors::Error;
use crate::observability::Severity;
use crate::types::{CapturedRequest, StructuredResponse};
use crate::validation;

const STATUS_HTML: &str = include_str!("status.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<Engine>,
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/status", get(api_status))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/status", get(|| async { axum::response::Html(STATUS_HTML) }))
        .route("/auth/login", post(auth::login))
        .route("/ws", get(ws_upgrade))
        .merge(admin_routes)
        .route("/{*slug}", any(slug_handler))
        .layer(middleware::from_fn_with_state(state.clone(), security_and_cors_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Logs an admission rejection to the observability sink (and the attached
/// dashboards) before the caller converts it to a response, so every 4xx
/// admission outcome in §4.5/§4.6/§7 is visible there too, not just in the
/// process's own tracing output.
fn log_admission_rejection(engine: &Engine, severity: Severity, err: &Error) {
    engine.sink().log(severity, format!("admission rejected: {err}"));
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: axum::extract::WebSocketUpgrade,
) -> Response {
    if !state.engine.rate_limit().check_control(addr.ip()) {
        let err = Error::RateLimited;
        log_admission_rejection(&state.engine, Severity::Security, &err);
        return err.into_response();
    }
    ws.on_upgrade(move |socket| run_session(socket, state.engine, addr.ip()))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "serverStartTime")]
    server_start_time: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "activeClients")]
    active_clients: Vec<String>,
    #[serde(rename = "pendingRequests")]
    pending_requests: usize,
    stats: crate::observability::stats::StatsSnapshot,
}

async fn api_status(State(state): State<AppState>) -> Response {
    let pending = state.engine.pending_count();
    let stats = state.engine.stats().snapshot(pending as u64);
    Json(StatusResponse {
        server_start_time: *SERVER_START_TIME,
        active_clients: state.engine.bound_slugs(),
        pending_requests: pending,
        stats,
    })
    .into_response()
}

static SERVER_START_TIME: std::sync::LazyLock<chrono::DateTime<chrono::Utc>> =
    std::sync::LazyLock::new(chrono::Utc::now);

/// Admission pipeline for `/{slug}` (§4.1): rate limit, slug validation,
/// whitelist, request-line/header sanitisation, and body capture, in that
/// order, before handing off to the dispatch engine.
async fn slug_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(raw_slug): Path<String>,
    request: Request<Body>,
) -> Response {
    let source = addr.ip();

    if !state.engine.rate_limit().check_http(source) {
        let err = Error::RateLimited;
        log_admission_rejection(&state.engine, Severity::Security, &err);
        return err.into_response();
    }

    let slug = match validation::validate_slug(&raw_slug) {
        Ok(slug) => slug,
        Err(e) => {
            log_admission_rejection(&state.engine, Severity::Http, &e);
            return e.into_response();
        }
    };

    if !state.config.slug_whitelist.is_empty() && !state.config.slug_whitelist.iter().any(|w| w == slug.as_str()) {
        let err = Error::SlugNotWhitelisted(slug.to_string());
        log_admission_rejection(&state.engine, Severity::Security, &err);
        return err.into_response();
    }

    let method = request.method().to_string();
    let url = request.uri().to_string();
    if let Err(e) = validation::validate_request_line(&method, &url) {
        log_admission_rejection(&state.engine, Severity::Security, &e);
        return e.into_response();
    }

    let raw_headers: BTreeMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();
    let headers = validation::sanitise_headers(&raw_headers);

    let bytes = match axum::body::to_bytes(request.into_body(), state.config.max_request_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let err = Error::PayloadTooLarge;
            log_admission_rejection(&state.engine, Severity::Http, &err);
            return err.into_response();
        }
    };
    let body = String::from_utf8_lossy(&bytes).into_owned();

    let captured = CapturedRequest { method, url, headers, body };

    match state.engine.submit(slug, captured, source).await {
        Ok(response) => structured_response_into_axum(response),
        Err(err) => err.into_response(),
    }
}

fn structured_response_into_axum(response: StructuredResponse) -> Response {
    let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Applies the fixed security header set to every reply, plus the CORS
/// headers when enabled (§6). Implemented as a single `from_fn` layer
/// rather than `tower_http::cors::CorsLayer` because the header values this
/// design calls for are fixed strings, not the dynamic origin-reflection
/// `CorsLayer` is built around.
async fn security_and_cors_headers(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff"));
    headers.insert(HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY"));
    headers.insert(HeaderName::from_static("x-xss-protection"), HeaderValue::from_static("1; mode=block"));
    headers.insert(HeaderName::from_static("referrer-policy"), HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    if state.config.enable_cors {
        let origin = if state.config.cors_allow_all() { "*".to_string() } else { state.config.allowed_origins.join(", ") };
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type, Authorization"));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum_test::TestServer;

    fn test_state() -> AppState {
        let config = Config::default();
        AppState { engine: Engine::new(config.clone()), config }
    }

    fn server() -> TestServer {
        let app = build_router(test_state()).into_make_service_with_connect_info::<SocketAddr>();
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn reserved_slug_is_rejected() {
        let server = server();
        let response = server.get("/status/anything").await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_dashboard_serves_unconditionally() {
        let server = server();
        let response = server.get("/status").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn queue_timeout_returns_504() {
        let mut config = Config::default();
        config.queue_wait_deadline = std::time::Duration::from_millis(20);
        let state = AppState { engine: Engine::new(config.clone()), config };
        let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
        let server = TestServer::new(app).unwrap();

        let response = server.get("/svc-no-handler").await;
        response.assert_status(StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn every_reply_carries_the_security_headers() {
        let server = server();
        let response = server.get("/status").await;
        response.assert_header("x-content-type-options", "nosniff");
        response.assert_header("x-frame-options", "DENY");
    }
}
