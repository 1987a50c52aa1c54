//! Download admission control
//!
//! [`Admission`] runs a download request through the three registries in a
//! fixed order:
//!
//! 1. rate limiter (per client key, process-wide [`RatePolicy`])
//! 2. request validation (domain allow-list, format id, declared size)
//! 3. quota headroom
//! 4. worker fetch
//! 5. artifact write (stored as `<id>.<ext>`) + registration
//! 6. quota commit of the actual byte count
//!
//! Quota is charged only after the artifact is safely registered, so a
//! failed fetch never costs the client anything.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::{QuotaStatus, QuotaTracker, RateDecision, RateLimiter, RatePolicy};
use crate::media::formats::{Quality, VideoInfo};
use crate::media::registry::{self, ArtifactRecord, ArtifactRegistry, NewArtifact, RegistryError};
use crate::media::validate;
use crate::media::worker::{ArtifactRequest, MediaWorker, WorkerError};

/// Reasons a request is refused. Every variant is an expected outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Daily download quota exhausted ({remaining_bytes} bytes remaining)")]
    QuotaExceeded { remaining_bytes: u64 },

    #[error("File size {size} bytes exceeds maximum of {max} bytes")]
    SizeExceeded { size: u64, max: u64 },

    #[error("File not found or has expired: {0}")]
    NotFound(String),

    #[error("Download failed: {0}")]
    Upstream(WorkerError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<RegistryError> for AdmissionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => AdmissionError::NotFound(id),
            RegistryError::TooLarge { size, max } => AdmissionError::SizeExceeded { size, max },
            RegistryError::Io(reason) => AdmissionError::Storage(reason),
        }
    }
}

impl From<WorkerError> for AdmissionError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::TooLarge { size, max } => AdmissionError::SizeExceeded { size, max },
            other => AdmissionError::Upstream(other),
        }
    }
}

/// Client download request body
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    #[serde(default)]
    pub quality: Option<String>,
    /// Size advertised by the metadata step, if the client knows it
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Returned once an artifact is registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadTicket {
    pub id: String,
    pub title: String,
    pub download_link: String,
    /// Unix seconds
    pub expires_at: i64,
    /// Requests left in the client's rate window; `None` when limiting is
    /// off or the client is exempt. Sent as headers, not in the body.
    #[serde(skip)]
    pub rate_limit_remaining: Option<u32>,
}

/// Request validation settings
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub allowed_domains: Vec<String>,
    pub enabled_qualities: HashSet<Quality>,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            allowed_domains: validate::DEFAULT_ALLOWED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            enabled_qualities: Quality::selectable().into_iter().collect(),
        }
    }
}

/// The admission façade shared by the HTTP handlers.
#[derive(Clone)]
pub struct Admission {
    rate_limiter: RateLimiter,
    quota: Arc<QuotaTracker>,
    registry: Arc<ArtifactRegistry>,
    worker: Arc<dyn MediaWorker>,
    settings: Arc<AdmissionSettings>,
    policy: RatePolicy,
}

impl Admission {
    pub fn new(
        rate_limiter: RateLimiter,
        quota: Arc<QuotaTracker>,
        registry: Arc<ArtifactRegistry>,
        worker: Arc<dyn MediaWorker>,
        settings: AdmissionSettings,
    ) -> Self {
        let policy = rate_limiter.policy();
        Self {
            rate_limiter,
            quota,
            registry,
            worker,
            settings: Arc::new(settings),
            policy,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.registry
    }

    pub fn worker(&self) -> &Arc<dyn MediaWorker> {
        &self.worker
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    fn check_url(&self, url: &str) -> Result<(), AdmissionError> {
        if url.trim().is_empty() {
            return Err(AdmissionError::InvalidRequest(
                "Video URL is required".to_string(),
            ));
        }
        if !validate::is_allowed_url(url, &self.settings.allowed_domains) {
            tracing::warn!(url = %url, "URL domain not allowed");
            return Err(AdmissionError::InvalidRequest(
                "URL domain is not allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch and classify metadata for `url`.
    pub async fn video_info(&self, url: &str) -> Result<VideoInfo, AdmissionError> {
        self.check_url(url)?;

        let raw = self.worker.fetch_metadata(url).await.map_err(|e| {
            tracing::error!(url = %url, error = %e, "failed to fetch video info");
            AdmissionError::from(e)
        })?;
        let info = VideoInfo::from_raw(raw, &self.settings.enabled_qualities);

        tracing::info!(title = %info.title, formats = info.formats.len(), "video info retrieved");
        Ok(info)
    }

    /// Admit, fetch, store and account one download for `client_key`.
    pub async fn admit_download(
        &self,
        client_key: &str,
        request: &DownloadRequest,
    ) -> Result<DownloadTicket, AdmissionError> {
        let rate_limit_remaining = match self.rate_limiter.check(client_key, self.policy) {
            RateDecision::Allowed { remaining } => remaining,
            RateDecision::Limited { retry_after_secs } => {
                return Err(AdmissionError::RateLimited { retry_after_secs });
            }
        };

        self.check_url(&request.url)?;
        if !validate::is_valid_format_id(&request.format_id) {
            tracing::warn!(format_id = %request.format_id, "invalid format id");
            return Err(AdmissionError::InvalidRequest(
                "Invalid format ID".to_string(),
            ));
        }

        let declared = request.file_size.unwrap_or(0);
        if declared > 0 {
            self.registry.check_size(declared).map_err(|e| {
                tracing::warn!(key = %client_key, file_size = declared, "declared size exceeds limit");
                AdmissionError::from(e)
            })?;
        }

        let headroom = self.quota.check_headroom(client_key, declared);
        if !headroom.allowed {
            return Err(AdmissionError::QuotaExceeded {
                remaining_bytes: headroom.remaining_bytes,
            });
        }

        let max_bytes = self.registry.config().max_artifact_bytes;
        let artifact_request = ArtifactRequest {
            url: request.url.clone(),
            format_id: request.format_id.clone(),
            quality: request.quality.clone().unwrap_or_default(),
        };
        let artifact = self
            .worker
            .fetch_artifact(&artifact_request, max_bytes)
            .await
            .map_err(|e| {
                tracing::error!(url = %request.url, error = %e, "download failed");
                AdmissionError::from(e)
            })?;

        let size = artifact.size();
        self.registry.check_size(size)?;

        let filename = validate::truncate_filename(
            &validate::sanitize_filename(&artifact.filename),
            validate::MAX_FILENAME_CHARS,
        );
        let id = ArtifactRegistry::generate_id();
        let path = self.registry.download_path(&id, &filename);

        self.registry.ensure_download_dir().await?;
        self.registry.persist_artifact(&path, &artifact.bytes).await?;

        let record = self.registry.register(
            &id,
            NewArtifact {
                filename,
                path,
                size_bytes: size,
                source_url: request.url.clone(),
            },
        );

        self.quota.commit(client_key, size);

        Ok(DownloadTicket {
            download_link: format!("/api/download/{}", record.id),
            id: record.id,
            title: record.filename,
            expires_at: record.expires_at.timestamp(),
            rate_limit_remaining,
        })
    }

    /// Resolve a download id to a tracked artifact whose file still exists.
    pub async fn lookup_artifact(&self, id: &str) -> Result<ArtifactRecord, AdmissionError> {
        let record = self.registry.lookup(id)?;
        if !registry::artifact_file_exists(&record.path).await {
            tracing::warn!(id = %id, path = %record.path.display(), "artifact file missing");
            return Err(AdmissionError::NotFound(id.to_string()));
        }
        Ok(record)
    }

    /// Quota snapshot for `client_key`.
    pub fn quota_status(&self, client_key: &str) -> QuotaStatus {
        self.quota.status(client_key)
    }
}
