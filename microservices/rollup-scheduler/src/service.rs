//! Rollup service lifecycle

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use sensorhub_core::{DependencyStatus, HealthStatus, ReadinessStatus, SensorHubService, ServiceConfig};
use sensorhub_tsdb::{PgStore, PoolConfig, TimeSeriesStore, TimeoutStore, TsdbPool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catchup::{subsample, CatchUpReport, SubsampleOptions};
use crate::clock::{SystemClock, WallClock};
use crate::config::{MeasurementConfigs, RollupConfig, RollupFile};
use crate::dispatch::{setup_all_notices, NoticeContext};
use crate::installer::create_all_cqs;
use crate::metrics::SchedulerMetrics;
use crate::notifier::NoticeSet;
use crate::policy::{PolicyRegistry, RollupTarget};
use crate::pubsub::{BroadcastHub, Publisher};
use crate::Result;

pub struct RollupService {
    config: RollupConfig,
    measurements: MeasurementConfigs,
    registry: PolicyRegistry,
    targets: Vec<RollupTarget>,
    store: Arc<dyn TimeSeriesStore>,
    db: Option<PgStore>,
    hub: Arc<BroadcastHub>,
    clock: Arc<dyn WallClock>,
    notices: Mutex<Option<NoticeSet>>,
    metrics: SchedulerMetrics,
    start_time: Instant,
}

impl RollupService {
    /// Build the service against LumaDB using environment settings
    pub async fn from_env() -> Result<Self> {
        let config = RollupConfig::from_env()?;
        let file = RollupFile::load(&config.config_path)?;

        let pool = TsdbPool::new(PoolConfig::from(&config.service))?;
        let db = PgStore::new(pool);
        if let Err(e) = db.ensure_schema().await {
            warn!(error = %e, "Could not ensure LumaDB schema, continuing");
        }

        let store = TimeoutStore::new(
            Arc::new(db.clone()),
            Duration::from_millis(config.store_timeout_ms),
        );

        let mut service = Self::with_store(config, &file, Arc::new(store), Arc::new(SystemClock))?;
        service.db = Some(db);
        Ok(service)
    }

    /// Build the service over an existing store. Fails on any configuration
    /// problem: unknown policy, empty or malformed strategy, bad interval.
    pub fn with_store(
        config: RollupConfig,
        file: &RollupFile,
        store: Arc<dyn TimeSeriesStore>,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self> {
        let registry = PolicyRegistry::from_config(&file.cq_policies)?;
        let targets = registry.targets(&file.measurements)?;

        info!(
            measurements = file.measurements.len(),
            policies = registry.len(),
            rollups = targets.len(),
            "Rollup configuration loaded"
        );

        Ok(Self {
            hub: Arc::new(BroadcastHub::new(config.hub_capacity)),
            config,
            measurements: file.measurements.clone(),
            registry,
            targets,
            store,
            db: None,
            clock,
            notices: Mutex::new(None),
            metrics: SchedulerMetrics::default(),
            start_time: Instant::now(),
        })
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.config.service
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn targets(&self) -> &[RollupTarget] {
        &self.targets
    }

    pub async fn install_rules(&self) -> Result<usize> {
        create_all_cqs(self.store.as_ref(), &self.measurements, &self.registry).await
    }

    /// One catch-up pass over every (source, destination) pair
    pub async fn run_catchup(&self) -> Vec<CatchUpReport> {
        let started = Instant::now();
        let passes = self.targets.iter().map(|target| {
            subsample(
                self.store.clone(),
                self.clock.as_ref(),
                SubsampleOptions::for_target(target),
            )
        });

        let mut reports = Vec::new();
        for (target, result) in self.targets.iter().zip(join_all(passes).await) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    self.metrics.catchup_failures.inc();
                    error!(
                        source = %target.source,
                        destination = %target.destination,
                        error = %e,
                        "Catch-up pass failed"
                    );
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        for report in &reports {
            self.metrics.record_pass(report, elapsed_ms);
        }
        reports
    }

    /// Start the per-query notifiers, replacing any already running. Each
    /// firing refreshes its destination up to the boundary, then publishes.
    pub fn start_notices(&self) -> Result<usize> {
        let publisher: Arc<dyn Publisher> = self.hub.clone();
        let ctx = NoticeContext {
            store: self.store.clone(),
            publisher,
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
        };
        let notices = setup_all_notices(ctx, &self.measurements, &self.registry, self.config.cq_delay_ms)?;
        let count = notices.len();

        if let Some(previous) = self.notices.lock().replace(notices) {
            previous.cancel_all();
        }
        Ok(count)
    }

    pub async fn stop_notices(&self) {
        let notices = self.notices.lock().take();
        if let Some(notices) = notices {
            notices.shutdown().await;
        }
        self.metrics.active_notifiers.set(0);
    }

    fn router(&self) -> axum::Router {
        let metrics = self.metrics.clone();
        let expected = self.targets.len();
        axum::Router::new()
            .route("/health", axum::routing::get(|| async { "OK" }))
            .route("/ready", axum::routing::get({
                let metrics = metrics.clone();
                move || {
                    let active = metrics.active_notifiers.get() as usize;
                    async move {
                        axum::Json(serde_json::json!({
                            "ready": active == expected,
                            "notifiers": active,
                            "rollups": expected,
                        }))
                    }
                }
            }))
            .route(
                "/metrics",
                axum::routing::get(move || {
                    let metrics = metrics.clone();
                    async move { axum::Json(metrics.snapshot()) }
                }),
            )
    }
}

#[async_trait]
impl SensorHubService for RollupService {
    fn service_id(&self) -> &'static str {
        "rollup-scheduler"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let mut dependencies = Vec::new();
        if let Some(db) = &self.db {
            let (available, latency_ms) = match db.ping().await {
                Ok(rtt) => (true, Some(rtt.as_millis() as u64)),
                Err(e) => {
                    warn!(error = %e, "LumaDB ping failed");
                    (false, None)
                }
            };
            dependencies.push(DependencyStatus {
                name: "lumadb".to_string(),
                available,
                latency_ms,
            });
        }

        let notifying = self.metrics.active_notifiers.get() as usize == self.targets.len();
        ReadinessStatus {
            ready: notifying && dependencies.iter().all(|d| d.available),
            dependencies,
        }
    }

    async fn shutdown(&self) -> sensorhub_core::Result<()> {
        info!("Shutting down rollup scheduler");
        self.stop_notices().await;
        for metric in self.metrics.snapshot() {
            info!(metric = %metric.name, value = metric.value, "Final metric");
        }
        Ok(())
    }

    async fn start(&self, shutdown: CancellationToken) -> sensorhub_core::Result<()> {
        info!(
            http = %self.config.service.http_bind,
            rollups = self.targets.len(),
            cq_delay_ms = self.config.cq_delay_ms,
            "Starting rollup scheduler"
        );

        if self.config.install_cqs_on_start {
            match self.install_rules().await {
                Ok(installed) => info!(installed, "Continuous queries in place"),
                Err(e) => error!(error = %e, "Continuous query installation incomplete"),
            }
        }

        if self.config.catchup_on_start && !shutdown.is_cancelled() {
            let reports = self.run_catchup().await;
            let written: usize = reports.iter().map(|r| r.windows_written()).sum();
            info!(passes = reports.len(), windows_written = written, "Startup catch-up finished");
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
        self.start_notices()?;

        let listener = tokio::net::TcpListener::bind(&self.config.service.http_bind).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
