//! Store Contract
//!
//! Everything the rollup pipeline needs from the time-series engine, expressed
//! as typed requests rather than query text.

use async_trait::async_trait;
use sensorhub_core::{Record, SeriesIdentity, Timestamp, Window};

use crate::{AggregationRule, Result};

/// Aggregate one series over one window
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub series: SeriesIdentity,
    pub window: Window,
    pub strategy: Vec<AggregationRule>,
}

impl AggregateQuery {
    pub fn new(series: SeriesIdentity, window: Window, strategy: &[AggregationRule]) -> Self {
        Self {
            series,
            window,
            strategy: strategy.to_vec(),
        }
    }
}

/// Engine-resident standing aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentRule {
    pub name: String,
    pub database: String,
    pub retention_policy: String,
    pub source: String,
    pub destination: String,
    pub interval_ms: i64,
    /// Aggregation clause with aliasing, e.g. `mean(x) as x, sum(y) as y`
    pub clause: String,
    /// Full engine-native statement text
    pub statement: String,
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Distinct series present in a measurement
    async fn list_series(&self, measurement: &str) -> Result<Vec<SeriesIdentity>>;

    /// Earliest timestamp of a series, `None` when the series is empty
    async fn first_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>>;

    /// Latest timestamp of a series, `None` when the series is empty
    async fn last_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>>;

    /// Aggregate the series over `[window.start, window.end)`.
    ///
    /// The returned record is stamped with `window.end` and carries one field
    /// per strategy entry, named by its `obs_type`. Returns `None` when the
    /// window holds no points.
    async fn query_aggregate(&self, query: &AggregateQuery) -> Result<Option<Record>>;

    /// Durably write one record into `destination`
    async fn write_record(&self, destination: &str, record: &Record) -> Result<()>;

    /// Install (or replace) a standing aggregation rule.
    ///
    /// A store that evaluates rules itself must stamp each output row with
    /// its window end, as [`TimeSeriesStore::query_aggregate`] does, so that
    /// rule output and catch-up agree on which window a row describes.
    async fn install_persistent_rule(&self, rule: &PersistentRule) -> Result<()>;

    /// Most recent record of a measurement across all of its series
    async fn latest_record(&self, measurement: &str) -> Result<Option<Record>>;
}

/// Shared write-side checks
pub(crate) fn validate_write(destination: &str, record: &Record) -> Result<()> {
    use crate::StoreError;

    if record.measurement != destination {
        return Err(StoreError::Rejected(format!(
            "record for measurement '{}' written to '{}'",
            record.measurement, destination
        )));
    }
    if record.fields.is_empty() {
        return Err(StoreError::Rejected(format!(
            "record at {} has no fields",
            record.timestamp
        )));
    }
    if record.fields.values().any(|v| !v.is_finite()) {
        return Err(StoreError::Rejected(format!(
            "record at {} has non-finite values",
            record.timestamp
        )));
    }
    Ok(())
}
