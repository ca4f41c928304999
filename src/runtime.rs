//! Process wiring shared by the API server and the worker binary.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::db;
use crate::services::checker::{CheckError, ItemChecker, MockItemChecker};
use crate::services::retention::RetentionSweeper;
use crate::services::storage::S3ItemChecker;
use crate::services::worker::{WorkerPool, WorkerPoolHandle};
use crate::store::{InMemoryJobStore, JobStore, PgJobStore};

/// Initialize structured JSON logging.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Open the configured job store, running migrations for PostgreSQL.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn JobStore>, sqlx::Error> {
    match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL job store");
            let pool = db::init_pool(url).await?;
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
            Ok(InMemoryJobStore::arc())
        }
    }
}

/// Pick the S3 checker when fully configured, the deterministic mock otherwise.
pub fn build_checker(config: &AppConfig) -> Result<Arc<dyn ItemChecker>, CheckError> {
    match config.s3_settings() {
        Some(settings) => {
            tracing::info!(bucket = %settings.bucket, "Using S3 item checker");
            Ok(Arc::new(S3ItemChecker::new(&settings)?))
        }
        None => {
            tracing::info!(
                divisor = config.mock_divisor,
                "S3 not configured, using mock item checker"
            );
            Ok(Arc::new(MockItemChecker::new(
                config.mock_divisor,
                config.download_base_url.clone(),
            )))
        }
    }
}

/// Worker pool plus retention sweeper running on the current runtime.
pub struct Background {
    shutdown: CancellationToken,
    pool: WorkerPoolHandle,
    sweeper: JoinHandle<()>,
}

impl Background {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        checker: Arc<dyn ItemChecker>,
        config: &AppConfig,
        name: &str,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(store.clone(), checker, config.worker_config(name))
            .spawn(shutdown.clone());
        let sweeper = RetentionSweeper::new(store, config.retention_policy(), config.sweep_interval());
        let sweeper = tokio::spawn(sweeper.run(shutdown.clone()));

        Self {
            shutdown,
            pool,
            sweeper,
        }
    }

    /// Stop taking new jobs, let in-flight ones finish their attempt, then return.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.pool.join().await;
        if let Err(e) = self.sweeper.await {
            tracing::error!(error = %e, "Retention sweeper panicked");
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
