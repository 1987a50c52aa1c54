//! Media pipeline module
//!
//! - **ArtifactRegistry**: downloaded files on disk with TTL expiry and sweeping
//! - **HttpWorker**: client for the extraction worker (metadata and artifacts)
//! - **formats**: quality classification of worker formats
//! - **disposition**: `Content-Disposition` filename parsing and building
//! - **validate**: URL allow-list and filename checks
//!
//! # Example
//!
//! ```ignore
//! use mediagate::media::{ArtifactRegistry, HttpWorker, RegistryConfig, WorkerConfig};
//!
//! let worker = HttpWorker::new(WorkerConfig::from_host_port("localhost", 5000))?;
//! let registry = ArtifactRegistry::new(RegistryConfig::default());
//!
//! let artifact = worker.fetch_artifact(&request, registry.config().max_artifact_bytes).await?;
//! let id = ArtifactRegistry::generate_id();
//! let path = registry.download_path(&id, &artifact.filename);
//! ```

pub mod disposition;
pub mod formats;
pub mod registry;
pub mod validate;
pub mod worker;

pub use formats::{FormatOption, Quality, RawMetadata, VideoInfo};
pub use registry::{
    ArtifactRecord, ArtifactRegistry, NewArtifact, RegistryConfig, RegistryError,
    DEFAULT_MAX_ARTIFACT_BYTES, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS,
};
pub use worker::{
    ArtifactRequest, FetchedArtifact, HttpWorker, MediaWorker, WorkerConfig, WorkerError,
    DEFAULT_WORKER_TIMEOUT_SECS,
};
