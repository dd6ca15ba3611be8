//! Server orchestrator for wiring together all components.
//!
//! This module provides the `ServerOrchestrator` that builds the namespace
//! components from a [`Config`], runs the HTTP server and the background
//! sweep of stale internal entries and spool files, and shuts both down
//! together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::audit::AuditLog;
use crate::config::Config;
use crate::files::{sweep_internal_entries, PathResolver, UploadIngestor};
use crate::http::multipart::sweep_spool;
use crate::http::{self, AppState};
use crate::progress::ProgressHub;

/// Interval between sweeps of stale staging, trash and spool entries (in seconds).
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Serving requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Server orchestrator that owns all subsystems.
pub struct ServerOrchestrator {
    /// Configuration.
    config: Config,
    /// Shared handler state.
    app_state: AppState,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl ServerOrchestrator {
    /// Creates a new orchestrator, creating the storage root and data
    /// directories when missing.
    pub async fn new(config: Config) -> Result<Self> {
        let root = config.storage_root();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create storage root: {}", root.display()))?;
        let spool_dir = config.spool_dir();
        tokio::fs::create_dir_all(&spool_dir)
            .await
            .with_context(|| format!("Failed to create spool directory: {}", spool_dir.display()))?;

        let resolver = Arc::new(
            PathResolver::new(&root)
                .with_context(|| format!("Invalid storage root: {}", root.display()))?,
        );
        info!(root = ?resolver.root(), "Storage root ready");

        let audit_path = config.audit_log_path();
        let audit = Arc::new(
            AuditLog::open(&audit_path)
                .await
                .with_context(|| format!("Failed to open upload log: {}", audit_path.display()))?,
        );

        let progress = Arc::new(ProgressHub::default());
        let ingestor = Arc::new(
            UploadIngestor::new(Arc::clone(&resolver), Arc::clone(&progress), config.ingest_options())
                .with_audit(audit),
        );

        let accounts = Arc::new(AccountStore::new(config.auth.accounts.clone()));
        if accounts.is_empty() {
            warn!("No accounts configured; every request will be refused");
        }

        let mut app_state = AppState::new(resolver, ingestor, progress, accounts, spool_dir);
        if let Some(dir) = &config.server.static_dir {
            app_state = app_state.with_static_dir(dir);
        }

        Ok(Self {
            config,
            app_state,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Shared handler state.
    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    /// The application router.
    pub fn router(&self) -> Router {
        http::router(self.app_state.clone())
    }

    /// Token cancelled when the orchestrator stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Absolute storage root.
    pub fn storage_root(&self) -> PathBuf {
        self.app_state.resolver.root().to_path_buf()
    }

    /// Remove stale internal entries and spool files once. Returns the
    /// number removed.
    pub async fn sweep_once(&self) -> usize {
        sweep(&self.storage_root(), &self.app_state.spool_dir, self.config.staging_max_age()).await
    }

    /// Bind the configured address and serve until [`stop`](Self::stop).
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.server.bind))?;
        self.serve(listener).await
    }

    /// Serve on `listener` until [`stop`](Self::stop).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Running;
        }

        let root = self.storage_root();
        let spool_dir = self.app_state.spool_dir.clone();
        let max_age = self.config.staging_max_age();
        let token = self.shutdown_token.clone();
        let sweeper = tokio::spawn(async move {
            Self::sweep_loop(root, spool_dir, max_age, token).await;
        });

        let addr = listener.local_addr().context("Failed to read listener address")?;
        info!(%addr, "Listening");

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(self.shutdown_token.clone().cancelled_owned())
            .await
            .context("HTTP server failed");

        self.shutdown_token.cancel();
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Sweep task ended abnormally");
        }

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Server stopped");
        served
    }

    /// Begin a graceful shutdown.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Running {
                *state = OrchestratorState::ShuttingDown;
            }
        }
        info!("Stopping server...");
        self.shutdown_token.cancel();
    }

    /// Periodically sweep stale internal entries until cancelled.
    async fn sweep_loop(
        root: PathBuf,
        spool_dir: PathBuf,
        max_age: Duration,
        shutdown_token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Sweep loop received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    sweep(&root, &spool_dir, max_age).await;
                }
            }
        }
    }
}

async fn sweep(root: &Path, spool_dir: &Path, max_age: Duration) -> usize {
    let internal = match sweep_internal_entries(root, max_age).await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "Sweep of internal entries failed");
            0
        }
    };
    let spooled = match sweep_spool(spool_dir, max_age).await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "Sweep of spool directory failed");
            0
        }
    };

    if internal + spooled > 0 {
        info!(internal, spooled, "Swept stale entries");
    }
    internal + spooled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{hash_password, Account};
    use protocol::Role;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.data_dir = temp_dir.path().join("data");
        config.server.bind = "127.0.0.1:0".to_string();
        config.storage.staging_max_age_secs = 0;
        config.auth.accounts = vec![Account {
            username: "admin".to_string(),
            password_sha256: hash_password("pw"),
            role: Role::Admin,
        }];
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = ServerOrchestrator::new(config).await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.storage_root().is_dir());
        assert!(temp_dir.path().join("data/spool").is_dir());
        assert!(temp_dir.path().join("data/uploads.log").is_file());
    }

    #[tokio::test]
    async fn test_sweep_once() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = ServerOrchestrator::new(create_test_config(&temp_dir))
            .await
            .unwrap();
        let root = orchestrator.storage_root();
        std::fs::write(root.join(".cloudshelf-0123456789abcdef.part"), b"x").unwrap();
        std::fs::write(root.join("kept.txt"), b"x").unwrap();
        let spool_dir = temp_dir.path().join("data/spool");
        std::fs::write(spool_dir.join("part-abandoned"), b"x").unwrap();

        assert_eq!(orchestrator.sweep_once().await, 2);
        assert!(root.join("kept.txt").exists());
        assert!(!spool_dir.join("part-abandoned").exists());
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = Arc::new(
            ServerOrchestrator::new(create_test_config(&temp_dir))
                .await
                .unwrap(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move { running.serve(listener).await });

        for _ in 0..50 {
            if orchestrator.state().await == OrchestratorState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);

        orchestrator.stop().await;
        handle.await.unwrap().unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_serve_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = ServerOrchestrator::new(create_test_config(&temp_dir))
            .await
            .unwrap();
        *orchestrator.state.write().await = OrchestratorState::Running;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(orchestrator.serve(listener).await.is_err());
    }
}
