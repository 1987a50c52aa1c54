//! HTTP server implementation
//!
//! Implements:
//! - Health (GET /api/health)
//! - Video metadata (GET /api/video/info?url=)
//! - Downloads (POST /api/download, GET /api/download/:id)
//! - Quota status (GET /api/quota)
//! - Admin rate-limit reset (DELETE /api/admin/ratelimit/:key)
//!
//! Every refusal is rendered from [`AdmissionError`] as
//! `{"error": <code>, "message": <text>, "code": <status>}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admission::{Admission, AdmissionError, DownloadRequest};
use crate::media::disposition;
use crate::server::ratelimit::{add_rate_limit_headers, client_key, rate_limit_middleware};

/// Default request timeout (5 minutes; downloads wait on the worker)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default max JSON body size (64KB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Upper bound on the worker check done by the health route
pub const WORKER_HEALTH_TIMEOUT_SECS: u64 = 3;

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bearer token for admin routes. When unset, admin routes only
    /// answer loopback callers.
    pub admin_token: Option<String>,
    /// Upper bound on handling one request
    pub request_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            admin_token: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HttpConfig>,
    pub admission: Admission,
    /// Server start time (Unix timestamp)
    pub start_time: i64,
}

impl AppState {
    fn trust_proxy_headers(&self) -> bool {
        self.admission.rate_limiter().config().trust_proxy_headers
    }

    fn client_key(&self, connect_info: Option<ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> String {
        client_key(connect_info.map(|ci| ci.0), headers, self.trust_proxy_headers())
    }
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router(config: HttpConfig, admission: Admission) -> Router {
    let limiter = admission.rate_limiter().clone();
    let request_timeout = config.request_timeout;
    let max_body_bytes = config.max_body_bytes;

    let state = AppState {
        config: Arc::new(config),
        admission,
        start_time: chrono::Utc::now().timestamp(),
    };

    // Rate limited by middleware. POST /api/download is counted by the
    // admission façade instead, and sets the same headers itself.
    let limited: Router<AppState> = Router::new()
        .route("/api/video/info", get(video_info_handler))
        .route("/api/download/:id", get(download_file_handler))
        .route("/api/quota", get(quota_handler))
        .route_layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));

    let unlimited: Router<AppState> = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/download", post(start_download_handler))
        .route("/api/admin/ratelimit/:key", delete(reset_rate_limit_handler));

    limited
        .merge(unlimited)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Error responses
// ============================================================================

impl AdmissionError {
    /// HTTP status for this refusal
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            AdmissionError::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AdmissionError::NotFound(_) => StatusCode::NOT_FOUND,
            AdmissionError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "rate_limit_exceeded",
            AdmissionError::QuotaExceeded { .. } => "quota_exhausted",
            AdmissionError::SizeExceeded { .. } => "file_too_large",
            AdmissionError::NotFound(_) => "not_found",
            AdmissionError::Upstream(_) => "download_failed",
            AdmissionError::InvalidRequest(_) => "invalid_request",
            AdmissionError::Storage(_) => "storage_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AdmissionError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            AdmissionError::QuotaExceeded { .. } => {
                "Daily download quota exhausted. Please try again after quota reset.".to_string()
            }
            AdmissionError::NotFound(_) => "File not found or has expired".to_string(),
            // Local paths stay in the logs.
            AdmissionError::Storage(_) => "Failed to store the downloaded file".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.error_code(),
            "message": self.public_message(),
            "code": status.as_u16(),
        }));
        let mut response = (status, body).into_response();

        if let AdmissionError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": "Unauthorized",
            "code": StatusCode::UNAUTHORIZED.as_u16(),
        })),
    )
        .into_response()
}

// ============================================================================
// Health Check
// ============================================================================

/// GET /api/health - Liveness probe, plus worker reachability.
///
/// The gateway answers 200 even when the worker is down; `worker` reports
/// `"up"` or `"down"`.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now().timestamp() - state.start_time;

    let worker_up = match tokio::time::timeout(
        Duration::from_secs(WORKER_HEALTH_TIMEOUT_SECS),
        state.admission.worker().health(),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "worker health check failed");
            false
        }
        Err(_) => {
            warn!("worker health check timed out");
            false
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
            "worker": if worker_up { "up" } else { "down" },
        })),
    )
        .into_response()
}

// ============================================================================
// Video and download handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub url: String,
}

/// GET /api/video/info?url=
async fn video_info_handler(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> Response {
    match state.admission.video_info(&query.url).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => err.into_response(),
    }
}

/// POST /api/download
async fn start_download_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "invalid download request");
            return AdmissionError::InvalidRequest("Invalid request format".to_string())
                .into_response();
        }
    };

    let key = state.client_key(connect_info, &headers);
    match state.admission.admit_download(&key, &request).await {
        Ok(ticket) => {
            let remaining = ticket.rate_limit_remaining;
            let mut response = Json(ticket).into_response();
            let limiter = state.admission.rate_limiter();
            add_rate_limit_headers(
                response.headers_mut(),
                limiter.config().threshold(limiter.policy()),
                remaining,
            );
            response
        }
        Err(err) => {
            warn!(client = %key, url = %request.url, error = %err, "download refused");
            let limited = matches!(err, AdmissionError::RateLimited { .. });
            let mut response = err.into_response();
            if limited {
                response
                    .headers_mut()
                    .insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            }
            response
        }
    }
}

/// GET /api/download/:id - Stream a registered artifact.
async fn download_file_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let record = match state.admission.lookup_artifact(&id).await {
        Ok(record) => record,
        Err(err) => return err.into_response(),
    };

    let file = match tokio::fs::File::open(&record.path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(id = %id, error = %e, "failed to open artifact");
            return AdmissionError::NotFound(id).into_response();
        }
    };

    info!(id = %id, filename = %record.filename, "artifact served");

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size_bytes));
    if let Ok(value) = HeaderValue::from_str(&disposition::build_header(&record.filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// GET /api/quota
async fn quota_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let key = state.client_key(connect_info, &headers);
    Json(state.admission.quota_status(&key)).into_response()
}

// ============================================================================
// Admin
// ============================================================================

/// DELETE /api/admin/ratelimit/:key
async fn reset_rate_limit_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    if let Some(response) = check_admin_auth(&state.config, &headers, connect_info.map(|ci| ci.0)) {
        return response;
    }

    let removed = state.admission.rate_limiter().reset(&key);
    Json(json!({ "ok": true, "key": key, "removed": removed })).into_response()
}

/// Check admin authentication
///
/// With a token configured the bearer must match it. Without one, only
/// loopback callers are allowed so an unconfigured server bound to
/// 0.0.0.0 never exposes admin routes.
fn check_admin_auth(
    config: &HttpConfig,
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> Option<Response> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim());

    let ok = match (&config.admin_token, provided) {
        (Some(expected), Some(provided)) => constant_time_eq(expected.as_bytes(), provided.as_bytes()),
        (Some(_), None) => false,
        (None, _) => remote_addr.map(|a| a.ip().is_loopback()).unwrap_or(false),
    };

    if ok {
        None
    } else {
        warn!("admin request rejected");
        Some(unauthorized_response())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
