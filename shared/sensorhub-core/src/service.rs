//! Service lifecycle shared by every SensorHub process

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, SensorHubError};

/// Liveness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness report with per-dependency detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
}

#[async_trait]
pub trait SensorHubService: Send + Sync + 'static {
    fn service_id(&self) -> &'static str;

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn health(&self) -> HealthStatus;

    async fn ready(&self) -> ReadinessStatus;

    /// Run the service until `shutdown` is cancelled. Returning early, with or
    /// without an error, ends the process.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Release background work once `start` has returned
    async fn shutdown(&self) -> Result<()>;
}

/// Drives one service from start to a graceful stop
pub struct MicroserviceRuntime {
    config: ServiceConfig,
    grace: Duration,
}

impl MicroserviceRuntime {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            grace: Duration::from_secs(30),
        }
    }

    /// How long `start` may take to return after shutdown is requested
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until Ctrl+C or SIGTERM
    pub async fn run<S: SensorHubService>(self, service: Arc<S>) -> Result<()> {
        self.run_until(service, wait_for_signal()).await
    }

    /// Run until `stop` resolves or the service ends on its own
    pub async fn run_until<S, F>(self, service: Arc<S>, stop: F) -> Result<()>
    where
        S: SensorHubService,
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        info!(
            service_id = service.service_id(),
            service_name = %self.config.service_name,
            http = %self.config.http_bind,
            version = service.version(),
            "Starting microservice"
        );

        let token = CancellationToken::new();
        let mut task = tokio::spawn({
            let service = service.clone();
            let token = token.clone();
            async move { service.start(token).await }
        });

        let outcome = tokio::select! {
            joined = &mut task => {
                let result = task_result(joined);
                if let Err(e) = &result {
                    error!(error = %e, code = e.error_code(), "Service stopped unexpectedly");
                }
                result
            }
            _ = stop => {
                info!("Shutdown requested, stopping gracefully");
                token.cancel();
                match tokio::time::timeout(self.grace, &mut task).await {
                    Ok(joined) => task_result(joined),
                    Err(_) => {
                        warn!(grace_ms = self.grace.as_millis() as u64, "Service did not stop in time, aborting");
                        task.abort();
                        Ok(())
                    }
                }
            }
        };

        if let Err(e) = service.shutdown().await {
            warn!(error = %e, "Error during shutdown");
        }

        info!(uptime_seconds = started.elapsed().as_secs(), "Microservice stopped");
        outcome
    }
}

fn task_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| SensorHubError::Internal(format!("service task failed: {}", e)))?
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
