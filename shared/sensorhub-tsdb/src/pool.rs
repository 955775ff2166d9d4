//! LumaDB connection pool

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use sensorhub_core::ServiceConfig;
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;
use tracing::info;

use crate::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub url: String,
    pub max_size: usize,
}

impl From<&ServiceConfig> for PoolConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            url: config.lumadb_url.clone(),
            max_size: config.lumadb_pool_size,
        }
    }
}

#[derive(Clone)]
pub struct TsdbPool {
    pool: Pool,
}

impl TsdbPool {
    /// Build the pool. Connections are opened lazily, so an unreachable
    /// server only shows up on first use.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(StoreError::Configuration("pool size must be positive".to_string()));
        }

        let pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| StoreError::Configuration(format!("Invalid URL: {}", e)))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        info!(max_size = config.max_size, "LumaDB pool ready");
        Ok(Self { pool })
    }

    pub async fn get(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Round trip of a trivial query on a pooled connection
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let conn = self.get().await?;
        conn.simple_query("SELECT 1").await.map_err(StoreError::Query)?;
        Ok(started.elapsed())
    }
}
