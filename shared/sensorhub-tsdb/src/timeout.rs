//! Per-call timeout for store interactions

use async_trait::async_trait;
use sensorhub_core::{Record, SeriesIdentity, Timestamp};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{AggregateQuery, PersistentRule, Result, StoreError, TimeSeriesStore};

/// Wraps a store so that every call fails with [`StoreError::Timeout`] once
/// it has been outstanding longer than the configured limit.
#[derive(Clone)]
pub struct TimeoutStore {
    inner: Arc<dyn TimeSeriesStore>,
    limit: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn TimeSeriesStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn guarded<T>(&self, operation: &'static str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after_ms: self.limit.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl TimeSeriesStore for TimeoutStore {
    async fn list_series(&self, measurement: &str) -> Result<Vec<SeriesIdentity>> {
        self.guarded("list_series", self.inner.list_series(measurement)).await
    }

    async fn first_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.guarded("first_timestamp", self.inner.first_timestamp(series)).await
    }

    async fn last_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.guarded("last_timestamp", self.inner.last_timestamp(series)).await
    }

    async fn query_aggregate(&self, query: &AggregateQuery) -> Result<Option<Record>> {
        self.guarded("query_aggregate", self.inner.query_aggregate(query)).await
    }

    async fn write_record(&self, destination: &str, record: &Record) -> Result<()> {
        self.guarded("write_record", self.inner.write_record(destination, record)).await
    }

    async fn install_persistent_rule(&self, rule: &PersistentRule) -> Result<()> {
        self.guarded("install_persistent_rule", self.inner.install_persistent_rule(rule))
            .await
    }

    async fn latest_record(&self, measurement: &str) -> Result<Option<Record>> {
        self.guarded("latest_record", self.inner.latest_record(measurement)).await
    }
}
