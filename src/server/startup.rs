//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real server on an ephemeral port, exercise its HTTP endpoints,
//! and shut it down cleanly. The shutdown flag is shared by the listener
//! and the three sweepers; flipping it stops all of them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::{Admission, AdmissionSettings};
use crate::clock::{system_clock, SharedClock};
use crate::config::AppConfig;
use crate::limits::{QuotaConfig, QuotaTracker, RateLimitConfig, RateLimiter};
use crate::media::registry::{ArtifactRegistry, RegistryConfig};
use crate::media::worker::{HttpWorker, MediaWorker, WorkerError};
use crate::server::http::{create_router, HttpConfig};
use crate::sweep::spawn_sweeper;

/// Everything needed to start a server.
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub http: HttpConfig,
    pub registry: RegistryConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub settings: AdmissionSettings,
    pub worker: Arc<dyn MediaWorker>,
    pub clock: SharedClock,
    /// When `false` (e.g. in tests), the sweepers are **not** spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Production config resolved from the environment, talking to the
    /// worker over HTTP.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, WorkerError> {
        let worker = HttpWorker::new(config.worker.clone())?;
        Ok(ServerConfig {
            bind_address: config.bind_address,
            http: config.http.clone(),
            registry: config.registry.clone(),
            quota: config.quota.clone(),
            rate_limit: config.rate_limit.clone(),
            settings: config.admission_settings(),
            worker: Arc::new(worker),
            clock: system_clock(),
            spawn_background_tasks: true,
        })
    }

    /// Minimal config suitable for integration tests.
    ///
    /// Binds to `127.0.0.1:0` (OS-assigned port), stores artifacts under
    /// `download_dir`, and does not spawn sweepers.
    pub fn for_testing(worker: Arc<dyn MediaWorker>, download_dir: PathBuf) -> Self {
        ServerConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            http: HttpConfig::default(),
            registry: RegistryConfig::default().with_download_dir(download_dir),
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            settings: AdmissionSettings::default(),
            worker,
            clock: system_clock(),
            spawn_background_tasks: false,
        }
    }

    /// Assemble the registries and the admission façade.
    pub fn build_admission(&self) -> Admission {
        let registry = ArtifactRegistry::with_clock(self.registry.clone(), self.clock.clone());
        let quota = QuotaTracker::with_clock(self.quota.clone(), self.clock.clone());
        let rate_limiter = RateLimiter::with_clock(self.rate_limit.clone(), self.clock.clone());

        Admission::new(
            rate_limiter,
            Arc::new(quota),
            Arc::new(registry),
            self.worker.clone(),
            self.settings.clone(),
        )
    }
}

/// Spawn one sweeper per registry, all bound to `shutdown_rx`.
pub fn spawn_sweepers(
    admission: &Admission,
    shutdown_rx: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let registry = admission.registry().clone();
    let registry_interval = registry.config().sweep_interval;

    let quota = admission.quota().clone();
    let quota_interval = quota.config().sweep_interval;

    let limiter = Arc::new(admission.rate_limiter().clone());
    let limiter_interval = limiter.config().sweep_interval;

    vec![
        spawn_sweeper(registry, registry_interval, shutdown_rx.clone()),
        spawn_sweeper(quota, quota_interval, shutdown_rx.clone()),
        spawn_sweeper(limiter, limiter_interval, shutdown_rx.clone()),
    ]
}

/// Handle to a running server.  Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    admission: Admission,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    sweepers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full local address (ip + port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// The admission façade serving this instance.
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Number of sweeper tasks started with this server.
    pub fn sweeper_count(&self) -> usize {
        self.sweepers.len()
    }

    /// Trigger graceful shutdown: flip the shared flag, then await the
    /// sweepers and the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        for sweeper in self.sweepers {
            if let Err(e) = sweeper.await {
                error!("Sweeper task panicked: {}", e);
            }
        }

        // Wait for the server task to finish (with a timeout to avoid hanging)
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("Server task returned error: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }
        info!("Server stopped");
    }
}

/// Start a server from a fully-assembled [`ServerConfig`].
///
/// Returns a [`ServerHandle`] that exposes the actual bound address and
/// provides a [`ServerHandle::shutdown`] method for clean teardown.
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admission = config.build_admission();
    admission
        .registry()
        .ensure_download_dir()
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let app = create_router(config.http, admission.clone());

    let sweepers = if config.spawn_background_tasks {
        spawn_sweepers(&admission, &shutdown_rx)
    } else {
        Vec::new()
    };

    // Bind TCP listener (supports port 0 for ephemeral port assignment)
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "HTTP server listening");

    // Spawn axum::serve as a background tokio task with graceful shutdown
    let mut shutdown_watch = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            // Wait until the shutdown channel is set to true
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        admission,
        server_task,
        sweepers,
    })
}

/// Run the service until SIGINT/SIGTERM.
pub async fn run_until_signal(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server_config = ServerConfig::from_app_config(config)?;
    info!(
        worker = %config.worker.base_url,
        download_dir = %config.registry.download_dir.display(),
        quota_enabled = config.quota.enabled,
        rate_limit_enabled = config.rate_limit.enabled,
        "mediagate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let handle = run_server_with_config(server_config).await?;

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            wait_ctrl_c().await
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    wait_ctrl_c().await
}

async fn wait_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            "signal-handler-error"
        }
    }
}
