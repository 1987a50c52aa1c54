//! Expiring artifact registry
//!
//! Tracks downloaded media files on disk with:
//! - A per-file size ceiling
//! - TTL-based expiry stamped at registration time
//! - Periodic sweeping that deletes expired files and forgets them
//! - Concurrent-safe access from request handlers and the sweep loop

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::clock::{system_clock, SharedClock};
use crate::sweep::Sweeper;

/// Default maximum artifact size (300MB)
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 300 * 1024 * 1024;

/// Default artifact lifetime (24 hours)
pub const DEFAULT_TTL_SECS: u64 = 86_400;

/// Default sweep interval (1 hour)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Errors that can occur during registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(String),
}

/// Metadata supplied by the caller when registering an artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Filename presented to the client on download
    pub filename: String,
    /// Location of the artifact on disk
    pub path: PathBuf,
    /// Size in bytes
    pub size_bytes: u64,
    /// URL the artifact was fetched from
    pub source_url: String,
}

/// A tracked artifact. Fields are write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: String,
    pub filename: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Whether the record has reached its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Configuration for the artifact registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory artifacts are written into
    pub download_dir: PathBuf,

    /// Maximum artifact size in bytes
    pub max_artifact_bytes: u64,

    /// Time-to-live for registered artifacts
    pub ttl: Duration,

    /// Interval between sweep runs
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl RegistryConfig {
    /// Set the download directory
    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = dir;
        self
    }

    /// Set the maximum artifact size
    pub fn with_max_artifact_bytes(mut self, max: u64) -> Self {
        self.max_artifact_bytes = max;
        self
    }

    /// Set the artifact TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Concurrent-safe registry of downloaded artifacts
///
/// Registering an id that is already present overwrites the previous
/// record; the old backing file is left for its own sweep to miss, so
/// callers should always register under a fresh [`generate_id`].
///
/// # Example
///
/// ```ignore
/// let registry = ArtifactRegistry::new(RegistryConfig::default());
/// registry.ensure_download_dir().await?;
///
/// let id = ArtifactRegistry::generate_id();
/// let path = registry.download_path(&id, "clip.mp4");
/// registry.persist_artifact(&path, &bytes).await?;
/// registry.register(&id, NewArtifact { filename: "clip.mp4".into(), path, size_bytes, source_url });
///
/// let record = registry.lookup(&id)?;
/// let removed = registry.sweep_expired().await;
/// ```
///
/// [`generate_id`]: ArtifactRegistry::generate_id
pub struct ArtifactRegistry {
    config: RegistryConfig,
    entries: RwLock<HashMap<String, ArtifactRecord>>,
    /// Serializes sweeps so overlapping runs never double-count
    sweep_lock: tokio::sync::Mutex<()>,
    clock: SharedClock,
}

impl ArtifactRegistry {
    /// Create a registry using the system clock
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a registry reading time from `clock`
    pub fn with_clock(config: RegistryConfig, clock: SharedClock) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            sweep_lock: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    /// Generate a fresh artifact id
    pub fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Create the download directory if it doesn't exist
    pub async fn ensure_download_dir(&self) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|e| RegistryError::Io(format!("Failed to create download directory: {}", e)))
    }

    /// Path an artifact with the given id and filename should be written to.
    ///
    /// The on-disk name is `<id>.<ext>`, or just `<id>` when `filename` has
    /// no short alphanumeric extension. The display name lives only in the
    /// record, so its length never reaches the filesystem.
    pub fn download_path(&self, id: &str, filename: &str) -> PathBuf {
        match storage_extension(filename) {
            Some(ext) => self.config.download_dir.join(format!("{}.{}", id, ext)),
            None => self.config.download_dir.join(id),
        }
    }

    /// Write `bytes` to `path` through a `.part` sibling renamed into place.
    ///
    /// On failure the partial file is removed, so nothing untracked is left
    /// in the download directory.
    pub async fn persist_artifact(&self, path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
        let part = part_path(path);

        let result = match fs::write(&part, bytes).await {
            Ok(()) => fs::rename(&part, path).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            match fs::remove_file(&part).await {
                Ok(()) => {}
                Err(cleanup) if cleanup.kind() == ErrorKind::NotFound => {}
                Err(cleanup) => {
                    tracing::warn!(
                        path = %part.display(),
                        error = %cleanup,
                        "Failed to remove partial artifact"
                    );
                }
            }
            tracing::error!(path = %path.display(), error = %e, "Failed to write artifact");
            return Err(RegistryError::Io(format!("failed to write artifact: {}", e)));
        }
        Ok(())
    }

    /// Start tracking an artifact, stamping `created_at = now` and
    /// `expires_at = now + ttl`. Overwrites any record with the same id.
    pub fn register(&self, id: &str, artifact: NewArtifact) -> ArtifactRecord {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::MAX);
        let record = ArtifactRecord {
            id: id.to_string(),
            filename: artifact.filename,
            path: artifact.path,
            size_bytes: artifact.size_bytes,
            source_url: artifact.source_url,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let replaced = self
            .entries
            .write()
            .insert(id.to_string(), record.clone())
            .is_some();

        tracing::info!(
            id = %id,
            filename = %record.filename,
            size = record.size_bytes,
            expires_at = %record.expires_at,
            replaced = replaced,
            "Artifact registered"
        );

        record
    }

    /// Look up an artifact by id. Does not extend its expiry.
    pub fn lookup(&self, id: &str) -> Result<ArtifactRecord, RegistryError> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Whether `size` fits under the configured ceiling
    pub fn validate_size(&self, size: u64) -> bool {
        size <= self.config.max_artifact_bytes
    }

    /// Like [`validate_size`](Self::validate_size) but returns the error to propagate
    pub fn check_size(&self, size: u64) -> Result<(), RegistryError> {
        if self.validate_size(size) {
            Ok(())
        } else {
            Err(RegistryError::TooLarge {
                size,
                max: self.config.max_artifact_bytes,
            })
        }
    }

    /// Stop tracking an artifact now and delete its file.
    ///
    /// Returns `false` if the id was not tracked.
    pub async fn evict(&self, id: &str) -> bool {
        let removed = self.entries.write().remove(id);
        match removed {
            Some(record) => {
                let _ = delete_artifact_file(&record).await;
                tracing::info!(id = %id, "Artifact evicted");
                true
            }
            None => false,
        }
    }

    /// Remove every artifact whose expiry has passed, deleting backing files.
    ///
    /// Files are deleted without holding the map lock. A failure to delete
    /// is logged and the record is still forgotten. Returns the number of
    /// records removed.
    pub async fn sweep_expired(&self) -> usize {
        let _guard = self.sweep_lock.lock().await;
        let expired = self.collect_expired(self.clock.now());
        if expired.is_empty() {
            return 0;
        }
        self.reclaim(expired).await
    }

    /// Forget the snapshotted `expired` records, then delete their files.
    ///
    /// A record whose id was re-registered since the snapshot is kept, and
    /// a file is never deleted while a live record still points at it.
    async fn reclaim(&self, expired: Vec<ArtifactRecord>) -> usize {
        let (removed, doomed, remaining) = {
            let mut entries = self.entries.write();
            let mut doomed = Vec::with_capacity(expired.len());
            for record in expired {
                let still_same = entries
                    .get(&record.id)
                    .map(|current| current.created_at == record.created_at)
                    .unwrap_or(false);
                if still_same {
                    entries.remove(&record.id);
                    doomed.push(record);
                }
            }
            let removed = doomed.len();
            let live_paths: HashSet<&PathBuf> = entries.values().map(|r| &r.path).collect();
            doomed.retain(|record| !live_paths.contains(&record.path));
            (removed, doomed, entries.len())
        };

        let mut delete_errors = 0usize;
        for record in &doomed {
            if !delete_artifact_file(record).await {
                delete_errors += 1;
            }
        }

        tracing::info!(
            removed = removed,
            error_count = delete_errors,
            remaining = remaining,
            "Artifact sweep completed"
        );

        removed
    }

    /// Snapshot expired records under the read lock.
    fn collect_expired(&self, now: DateTime<Utc>) -> Vec<ArtifactRecord> {
        self.entries
            .read()
            .values()
            .filter(|record| record.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Number of tracked artifacts
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no artifacts are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total size of tracked artifacts
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|r| r.size_bytes).sum()
    }

    /// Number of records past expiry that have not been swept yet
    pub fn expired_count(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .values()
            .filter(|r| r.is_expired_at(now))
            .count()
    }

    /// List all tracked artifacts
    pub fn list(&self) -> Vec<ArtifactRecord> {
        self.entries.read().values().cloned().collect()
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

#[async_trait]
impl Sweeper for ArtifactRegistry {
    fn name(&self) -> &'static str {
        "artifacts"
    }

    async fn sweep(&self) -> usize {
        self.sweep_expired().await
    }
}

/// Delete the file behind `record`. Returns `false` only for unexpected failures;
/// a file that is already gone counts as success.
async fn delete_artifact_file(record: &ArtifactRecord) -> bool {
    match fs::remove_file(&record.path).await {
        Ok(()) => {
            tracing::debug!(id = %record.id, path = %record.path.display(), "Removed artifact file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(id = %record.id, path = %record.path.display(), "Artifact file already deleted");
            true
        }
        Err(e) => {
            tracing::warn!(
                id = %record.id,
                path = %record.path.display(),
                error = %e,
                "Failed to remove artifact file"
            );
            false
        }
    }
}

/// Longest extension kept in an on-disk artifact name
const MAX_EXTENSION_LEN: usize = 16;

/// Extension of `filename` if it is short and plain ASCII alphanumeric.
fn storage_extension(filename: &str) -> Option<&str> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Whether a path exists on disk (used by the download route before streaming)
pub async fn artifact_file_exists(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
