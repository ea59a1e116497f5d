use crate::api::{create_api_router, AppState};
use crate::application::DependencyContainer;
use crate::jobs::JobRunner;
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Manages application lifecycle events and graceful shutdown
pub struct ApplicationLifecycle {
    container: Arc<DependencyContainer>,
}

impl ApplicationLifecycle {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Validate configuration and check the store is reachable
    pub async fn initialize(&self) -> Result<()> {
        info!("🚀 Initializing application...");

        self.container.config.validate()?;

        if !self.container.health_check().await? {
            return Err(anyhow::anyhow!("Initial health check failed"));
        }

        info!("✅ Application initialized successfully");
        Ok(())
    }

    /// Long-running mode: background AI worker, cron jobs and the trigger
    /// API, until a shutdown signal arrives.
    pub async fn serve(&self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker = self
            .container
            .start_processing_worker(shutdown_tx.subscribe())
            .await;

        let jobs = Arc::new(
            JobRunner::new(
                self.container.config.jobs.clone(),
                self.container.job_services(),
                Some(self.container.metrics.clone()),
            )
            .await?,
        );
        jobs.start().await?;

        let router = create_api_router(AppState {
            container: self.container.clone(),
            jobs: jobs.clone(),
        });
        let addr = format!("0.0.0.0:{}", self.container.config.operational.http_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        info!("🌐 Trigger API listening on {}", addr);

        let server = axum::serve(listener, router).with_graceful_shutdown(Self::wait_for_shutdown());
        if let Err(e) = server.await {
            error!("HTTP server error: {}", e);
        }

        self.shutdown(&jobs, &shutdown_tx, worker).await
    }

    async fn shutdown(
        &self,
        jobs: &JobRunner,
        shutdown_tx: &broadcast::Sender<()>,
        worker: Option<tokio::task::JoinHandle<()>>,
    ) -> Result<()> {
        info!("🛑 Initiating graceful shutdown...");

        if let Err(e) = jobs.shutdown().await {
            error!("Error stopping job runner: {}", e);
        }

        let _ = shutdown_tx.send(());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Processing worker ended abnormally: {}", e);
            }
        }

        let queue = self.container.processing_queue.snapshot();
        if queue.depth > 0 {
            warn!(
                pending = queue.depth,
                "Batches left in the processing queue; their messages stay indexed"
            );
        }

        if let Some(pool) = &self.container.db_pool {
            pool.close().await;
        }

        info!("🎉 Graceful shutdown completed");
        Ok(())
    }

    /// Wait for shutdown signals
    pub async fn wait_for_shutdown() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install terminate signal handler: {}", e);
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    }
}
