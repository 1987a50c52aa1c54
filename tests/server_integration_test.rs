//! Integration tests for the server startup / shutdown lifecycle.
//!
//! Each test spins up a real server on an ephemeral port via
//! [`run_server_with_config`], backed by a wiremock stand-in for the media
//! worker, exercises it over HTTP, and shuts it down cleanly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mediagate::limits::{QuotaConfig, RateLimitConfig};
use mediagate::media::worker::{HttpWorker, WorkerConfig};
use mediagate::server::startup::{run_server_with_config, ServerConfig, ServerHandle};

const VIDEO_URL: &str = "https://www.youtube.com/watch?v=abc123";

struct TestServer {
    handle: ServerHandle,
    worker: MockServer,
    _dir: TempDir,
}

async fn start_with(customize: impl FnOnce(&mut ServerConfig)) -> TestServer {
    mediagate::logging::init_test_logging();
    let worker = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let http_worker =
        HttpWorker::new(WorkerConfig::default().with_base_url(worker.uri())).unwrap();
    let mut config = ServerConfig::for_testing(Arc::new(http_worker), dir.path().join("downloads"));
    customize(&mut config);

    let handle = run_server_with_config(config).await.unwrap();
    TestServer {
        handle,
        worker,
        _dir: dir,
    }
}

/// Spin up a lightweight test server with all defaults.
async fn start_test_server() -> TestServer {
    start_with(|_| {}).await
}

async fn mount_download(worker: &MockServer, body: &[u8]) {
    Mock::given(method("POST"))
        .and(path("/api/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "content-disposition",
                    "attachment; filename*=UTF-8''Caf%C3%A9%20clip.mp4",
                )
                .set_body_bytes(body.to_vec()),
        )
        .mount(worker)
        .await;
}

async fn post_download(base_url: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/download", base_url))
        .json(&json!({ "url": VIDEO_URL, "format_id": "22", "quality": "HD" }))
        .send()
        .await
        .expect("POST /api/download failed")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let server = start_test_server().await;
    assert_ne!(server.handle.port(), 0, "OS should assign a non-zero port");

    let resp = reqwest::get(format!("{}/api/health", server.handle.base_url()))
        .await
        .expect("GET /api/health failed");
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "mediagate");
    assert!(body.get("uptimeSeconds").is_some());
    // Nothing mounted on the worker's /health yet.
    assert_eq!(body["worker"], "down");

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "healthy" })))
        .mount(&server.worker)
        .await;

    let body: Value = reqwest::get(format!("{}/api/health", server.handle.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["worker"], "up");

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_route_returns_404() {
    let server = start_test_server().await;

    let resp = reqwest::get(format!("{}/does-not-exist", server.handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_completes() {
    let server = start_test_server().await;
    let addr = server.handle.local_addr();

    let resp = reqwest::get(format!("{}/api/health", server.handle.base_url()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    tokio::time::timeout(Duration::from_secs(10), server.handle.shutdown())
        .await
        .expect("shutdown should complete within 10 seconds");

    assert!(
        tokio::net::TcpStream::connect(addr).await.is_err(),
        "listener should be closed after shutdown"
    );
}

// ---------------------------------------------------------------------------
// Media flow
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_video_info_proxies_worker_metadata() {
    let server = start_test_server().await;
    Mock::given(method("POST"))
        .and(path("/api/info"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "abc123",
            "title": "Sample",
            "duration": 93.4,
            "thumbnail": "https://i.ytimg.com/abc123.jpg",
            "uploader": "someone",
            "url": VIDEO_URL,
            "formats": [
                { "format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2" },
                { "format_id": "137", "ext": "mp4", "vcodec": "avc1", "acodec": "none", "resolution": "1920x1080" },
                { "format_id": "sb0", "vcodec": "none" }
            ]
        })))
        .mount(&server.worker)
        .await;

    let resp = reqwest::Client::new()
        .get(format!("{}/api/video/info", server.handle.base_url()))
        .query(&[("url", VIDEO_URL)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-ratelimit-remaining"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["title"], "Sample");
    assert_eq!(body["duration"], 93);
    let formats = body["formats"].as_array().unwrap();
    assert_eq!(formats.len(), 2);
    assert_eq!(formats[0]["quality"], "Audio");
    assert_eq!(formats[1]["quality"], "FHD");

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_then_fetch_artifact() {
    let server = start_test_server().await;
    mount_download(&server.worker, b"0123456789").await;
    let base_url = server.handle.base_url();

    let resp = post_download(&base_url).await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-ratelimit-limit"));
    assert!(resp.headers().contains_key("x-ratelimit-remaining"));
    let ticket: Value = resp.json().await.unwrap();
    assert_eq!(ticket["title"], "Café clip.mp4");
    let link = ticket["download_link"].as_str().unwrap().to_string();

    let resp = reqwest::get(format!("{}{}", base_url, link)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-disposition"],
        "attachment; filename*=UTF-8''Caf%C3%A9%20clip.mp4"
    );
    assert_eq!(&resp.bytes().await.unwrap()[..], b"0123456789");

    assert_eq!(server.handle.admission().registry().total_bytes(), 10);
    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_failure_maps_to_bad_gateway() {
    let server = start_test_server().await;
    Mock::given(method("POST"))
        .and(path("/api/download"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "extractor crashed" })))
        .mount(&server.worker)
        .await;

    let resp = post_download(&server.handle.base_url()).await;
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "download_failed");
    assert!(body["message"].as_str().unwrap().contains("extractor crashed"));

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_artifact_rejected() {
    let server = start_with(|config| {
        config.registry = config.registry.clone().with_max_artifact_bytes(4);
    })
    .await;
    mount_download(&server.worker, b"too many bytes").await;

    let resp = post_download(&server.handle.base_url()).await;
    assert_eq!(resp.status(), 413);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "file_too_large");
    assert!(server.handle.admission().registry().is_empty());

    server.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// Admission limits
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quota_exhaustion_and_status() {
    let server = start_with(|config| {
        config.quota = QuotaConfig::default().enabled().with_daily_limit_bytes(15);
    })
    .await;
    mount_download(&server.worker, b"0123456789").await;
    let base_url = server.handle.base_url();

    assert_eq!(post_download(&base_url).await.status(), 200);
    assert_eq!(post_download(&base_url).await.status(), 200);

    let resp = post_download(&base_url).await;
    assert_eq!(resp.status(), 402);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "quota_exhausted");
    assert_eq!(body["code"], 402);

    let status: Value = reqwest::get(format!("{}/api/quota", base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["used_bytes"], 20);
    assert_eq!(status["limit_bytes"], 15);
    assert_eq!(status["remaining_bytes"], 0);
    assert!(status["window_reset_at"].is_string());

    server.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_trips_and_admin_reset_clears() {
    let server = start_with(|config| {
        config.rate_limit = RateLimitConfig::builder()
            .requests_per_window(2)
            .burst_size(0)
            .build();
    })
    .await;
    let base_url = server.handle.base_url();
    let quota_url = format!("{}/api/quota", base_url);

    for expected_remaining in ["1", "0"] {
        let resp = reqwest::get(&quota_url).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "2");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], expected_remaining);
    }

    let resp = reqwest::get(&quota_url).await.unwrap();
    assert_eq!(resp.status(), 429);
    let retry_after: u64 = resp.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "rate_limit_exceeded");

    // No admin token configured: loopback callers may reset.
    let resp = reqwest::Client::new()
        .delete(format!("{}/api/admin/ratelimit/127.0.0.1", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], true);

    assert_eq!(reqwest::get(&quota_url).await.unwrap().status(), 200);

    server.handle.shutdown().await;
}
