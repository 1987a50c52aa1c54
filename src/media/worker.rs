//! HTTP client for the extraction worker
//!
//! The worker exposes three endpoints:
//! - `POST /api/info` with `{url}` returns raw metadata
//! - `POST /api/download` with `{url, format_id, quality}` returns the file
//!   body, named through `Content-Disposition`
//! - `GET /health`
//!
//! Artifact bodies are streamed with a size ceiling so an oversized file is
//! rejected before it is fully buffered.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use super::disposition;
use super::formats::RawMetadata;

/// Default worker request timeout (60s)
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 60;

/// Errors returned by the worker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker request failed: {0}")]
    Request(String),

    #[error("worker returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid worker response: {0}")]
    Decode(String),

    #[error("artifact too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
}

/// Parameters forwarded to the worker's download endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRequest {
    pub url: String,
    pub format_id: String,
    pub quality: String,
}

/// A file produced by the worker.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedArtifact {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// The extraction backend as seen by admission control.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Fetch raw metadata for `url`.
    async fn fetch_metadata(&self, url: &str) -> Result<RawMetadata, WorkerError>;

    /// Produce the artifact described by `request`, refusing bodies larger
    /// than `max_bytes`.
    async fn fetch_artifact(
        &self,
        request: &ArtifactRequest,
        max_bytes: u64,
    ) -> Result<FetchedArtifact, WorkerError>;

    /// Check that the worker is reachable.
    async fn health(&self) -> Result<(), WorkerError>;
}

/// Worker connection settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL, e.g. `http://localhost:5000`
    pub base_url: String,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    /// Build a base URL from host and port.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{}:{}", host, port),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// reqwest-backed [`MediaWorker`].
#[derive(Debug, Clone)]
pub struct HttpWorker {
    client: Client,
    base_url: String,
}

impl HttpWorker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WorkerError::Request(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into [`WorkerError::Status`], keeping the
    /// worker's `message`/`error` text when it sent JSON.
    async fn status_error(response: reqwest::Response) -> WorkerError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body);
        WorkerError::Status { status, message }
    }

    async fn read_body_with_limit(
        response: reqwest::Response,
        max_bytes: u64,
    ) -> Result<Vec<u8>, WorkerError> {
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| WorkerError::Request(format!("failed to read body: {}", e)))?;

            let new_size = body.len() as u64 + chunk.len() as u64;
            if new_size > max_bytes {
                return Err(WorkerError::TooLarge {
                    size: new_size,
                    max: max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl MediaWorker for HttpWorker {
    async fn fetch_metadata(&self, url: &str) -> Result<RawMetadata, WorkerError> {
        let response = self
            .client
            .post(self.endpoint("/api/info"))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| WorkerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::status_error(response).await;
            tracing::warn!(url = %url, error = %err, "worker rejected info request");
            return Err(err);
        }

        let metadata: RawMetadata = response
            .json()
            .await
            .map_err(|e| WorkerError::Decode(e.to_string()))?;

        tracing::debug!(
            url = %url,
            title = %metadata.title,
            formats = metadata.formats.len(),
            "worker metadata received"
        );
        Ok(metadata)
    }

    async fn fetch_artifact(
        &self,
        request: &ArtifactRequest,
        max_bytes: u64,
    ) -> Result<FetchedArtifact, WorkerError> {
        let response = self
            .client
            .post(self.endpoint("/api/download"))
            .json(request)
            .send()
            .await
            .map_err(|e| WorkerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::status_error(response).await;
            tracing::warn!(url = %request.url, error = %err, "worker rejected download request");
            return Err(err);
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(WorkerError::TooLarge {
                    size: length,
                    max: max_bytes,
                });
            }
        }

        let headers = response.headers();
        let filename = disposition::filename_or_default(
            headers
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok()),
        );
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = Self::read_body_with_limit(response, max_bytes).await?;

        tracing::debug!(
            filename = %filename,
            size_bytes = bytes.len(),
            "worker artifact received"
        );

        Ok(FetchedArtifact {
            filename,
            bytes,
            content_type,
        })
    }

    async fn health(&self) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .send()
            .await
            .map_err(|e| WorkerError::Request(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }
}
