//! Rate limiting middleware
//!
//! Applies the process-wide [`RateLimiter`] to the routes it is layered on.
//! The client key is the caller's IP, taken from proxy headers only when
//! `trust_proxy_headers` is set.
//!
//! `POST /api/download` is deliberately not layered: the admission façade
//! consults the same limiter with the same policy, and counting the request
//! twice would halve the effective limit.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::admission::AdmissionError;
use crate::limits::{RateDecision, RateLimiter};

/// Key used when no client address is available
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extract client IP from request
pub fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
) -> Option<IpAddr> {
    if trust_proxy {
        // Leftmost X-Forwarded-For entry is the original client.
        if let Some(ip) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return Some(ip);
        }

        if let Some(ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return Some(ip);
        }
    }

    remote_addr.map(|addr| addr.ip())
}

/// Client key for quota and rate accounting.
pub fn client_key(remote_addr: Option<SocketAddr>, headers: &HeaderMap, trust_proxy: bool) -> String {
    extract_client_ip(remote_addr, headers, trust_proxy)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = limiter.config();
    if !config.enabled {
        return next.run(request).await;
    }

    let remote_addr = connect_info.map(|ci| ci.0);
    let Some(client_ip) = extract_client_ip(remote_addr, request.headers(), config.trust_proxy_headers)
    else {
        warn!("Rate limit: could not determine client IP");
        return next.run(request).await;
    };

    let policy = limiter.policy();
    match limiter.check(&client_ip.to_string(), policy) {
        RateDecision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(
                response.headers_mut(),
                config.threshold(policy),
                remaining,
            );
            response
        }
        RateDecision::Limited { retry_after_secs } => {
            warn!(
                client = %client_ip,
                path = %request.uri().path(),
                "rate limit exceeded"
            );
            let mut response = AdmissionError::RateLimited { retry_after_secs }.into_response();
            response
                .headers_mut()
                .insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            response
        }
    }
}

/// Add rate limit headers to response
pub(crate) fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: Option<u32>) {
    // Exempt keys get no headers.
    let Some(remaining) = remaining else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RateLimitConfig;
    use axum::{http::StatusCode, middleware, routing::get, Router};
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn limited_router(limiter: RateLimiter) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
    }

    fn request_from(ip: [u8; 4]) -> Request<Body> {
        let mut req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        req
    }

    #[test]
    fn test_extract_client_ip_direct() {
        let headers = HeaderMap::new();
        let addr = Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            12345,
        ));

        let ip = extract_client_ip(addr, &headers, false);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn test_extract_client_ip_xff() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.50, 70.41.3.18".parse().unwrap(),
        );
        let addr = Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));

        // Without trust, should use direct address
        let ip = extract_client_ip(addr, &headers, false);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));

        // With trust, should use XFF
        let ip = extract_client_ip(addr, &headers, true);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50))));
    }

    #[test]
    fn test_extract_client_ip_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.100".parse().unwrap());

        let ip = extract_client_ip(None, &headers, true);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 100))));
    }

    #[test]
    fn test_client_key_unknown() {
        assert_eq!(client_key(None, &HeaderMap::new(), false), UNKNOWN_CLIENT);
    }

    #[tokio::test]
    async fn test_middleware_sets_headers_then_limits() {
        let limiter = RateLimiter::new(
            RateLimitConfig::builder()
                .requests_per_window(2)
                .burst_size(0)
                .build(),
        );
        let router = limited_router(limiter);

        let response = router.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");

        let response = router.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let response = router.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        // Other clients are unaffected.
        let response = router.oneshot(request_from([10, 0, 0, 2])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_uses_burst_threshold() {
        let limiter = RateLimiter::new(
            RateLimitConfig::builder()
                .requests_per_window(1)
                .burst_size(1)
                .build(),
        );
        let router = limited_router(limiter);

        for _ in 0..2 {
            let response = router.clone().oneshot(request_from([10, 0, 0, 3])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        }
        let response = router.oneshot(request_from([10, 0, 0, 3])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_middleware_without_client_ip_passes() {
        let limiter = RateLimiter::new(RateLimitConfig::builder().requests_per_window(0).build());
        let router = limited_router(limiter.clone());

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(limiter.stats().tracked_keys, 0);
    }
}
