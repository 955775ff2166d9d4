//! Rollup Scheduler
//!
//! Downsampling scheduler for SensorHub measurements backed by LumaDB.

use anyhow::Context;
use rollup_scheduler::RollupService;
use sensorhub_core::MicroserviceRuntime;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sensorhub_telemetry::init("rollup-scheduler")?;

    info!("Starting Rollup Scheduler");

    let service = RollupService::from_env()
        .await
        .context("failed to build rollup scheduler")?;
    MicroserviceRuntime::new(service.service_config().clone())
        .run(Arc::new(service))
        .await?;

    Ok(())
}
