//! In-process store
//!
//! Keeps every series in ordered maps and evaluates aggregates directly.
//! Faults can be injected per operation to exercise failure paths.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sensorhub_core::{Record, SeriesIdentity, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::store::validate_write;
use crate::{AggregateQuery, PersistentRule, Result, StoreError, TimeSeriesStore};

type Tags = (Option<String>, Option<String>);
type Points = BTreeMap<Timestamp, BTreeMap<String, f64>>;

/// Operation that should fail until cleared
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `write_record` into `measurement` at `timestamp`
    WriteAt {
        measurement: String,
        timestamp: Timestamp,
    },
    /// `query_aggregate` on `measurement` for the window ending at `window_end`
    AggregateAt {
        measurement: String,
        window_end: Timestamp,
    },
    /// `first_timestamp` and `last_timestamp` on any series of `measurement`
    Bounds { measurement: String },
    /// `latest_record` on `measurement`
    Latest { measurement: String },
    /// `install_persistent_rule` for rule `name`
    Install { name: String },
    /// `list_series` on `measurement`
    ListSeries { measurement: String },
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, BTreeMap<Tags, Points>>>,
    rules: RwLock<BTreeMap<String, PersistentRule>>,
    faults: Mutex<HashSet<Fault>>,
    write_log: Mutex<Vec<Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw point without going through the write log
    pub fn insert(&self, record: Record) {
        let mut data = self.data.write();
        let points = data
            .entry(record.measurement.clone())
            .or_default()
            .entry((record.platform.clone(), record.stream.clone()))
            .or_default();
        points.entry(record.timestamp).or_default().extend(record.fields);
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Records accepted by `write_record`, in write order
    pub fn written(&self, measurement: &str) -> Vec<Record> {
        self.write_log
            .lock()
            .iter()
            .filter(|r| r.measurement == measurement)
            .cloned()
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.write_log.lock().len()
    }

    pub fn installed_rules(&self) -> Vec<PersistentRule> {
        self.rules.read().values().cloned().collect()
    }

    fn check(&self, fault: Fault) -> Result<()> {
        if self.faults.lock().contains(&fault) {
            return Err(StoreError::Unavailable(format!("injected fault: {:?}", fault)));
        }
        Ok(())
    }

    fn with_points<T>(&self, series: &SeriesIdentity, f: impl FnOnce(&Points) -> T) -> Option<T> {
        let data = self.data.read();
        data.get(&series.measurement)
            .and_then(|by_tags| by_tags.get(&(series.platform.clone(), series.stream.clone())))
            .map(f)
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn list_series(&self, measurement: &str) -> Result<Vec<SeriesIdentity>> {
        self.check(Fault::ListSeries {
            measurement: measurement.to_string(),
        })?;

        let data = self.data.read();
        Ok(data
            .get(measurement)
            .map(|by_tags| {
                by_tags
                    .iter()
                    .filter(|(_, points)| !points.is_empty())
                    .map(|((platform, stream), _)| SeriesIdentity {
                        measurement: measurement.to_string(),
                        platform: platform.clone(),
                        stream: stream.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn first_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.check(Fault::Bounds {
            measurement: series.measurement.clone(),
        })?;
        Ok(self
            .with_points(series, |points| points.keys().next().copied())
            .flatten())
    }

    async fn last_timestamp(&self, series: &SeriesIdentity) -> Result<Option<Timestamp>> {
        self.check(Fault::Bounds {
            measurement: series.measurement.clone(),
        })?;
        Ok(self
            .with_points(series, |points| points.keys().next_back().copied())
            .flatten())
    }

    async fn query_aggregate(&self, query: &AggregateQuery) -> Result<Option<Record>> {
        self.check(Fault::AggregateAt {
            measurement: query.series.measurement.clone(),
            window_end: query.window.end,
        })?;

        let exprs = query
            .strategy
            .iter()
            .map(|rule| rule.parse().map(|expr| (rule.obs_type.clone(), expr)))
            .collect::<Result<Vec<_>>>()?;

        let window = query.window;
        let aggregated = self.with_points(&query.series, |points| {
            let in_window: Vec<&BTreeMap<String, f64>> =
                points.range(window.start..window.end).map(|(_, fields)| fields).collect();
            if in_window.is_empty() {
                return None;
            }

            let mut record = Record::new(&query.series, window.end);
            for (obs_type, expr) in &exprs {
                let samples: Vec<f64> = in_window
                    .iter()
                    .filter_map(|fields| fields.get(&expr.field).copied())
                    .collect();
                if let Some(value) = expr.func.apply(&samples) {
                    record.fields.insert(obs_type.clone(), value);
                }
            }
            Some(record)
        });

        Ok(aggregated.flatten().filter(|r| !r.fields.is_empty()))
    }

    async fn write_record(&self, destination: &str, record: &Record) -> Result<()> {
        self.check(Fault::WriteAt {
            measurement: destination.to_string(),
            timestamp: record.timestamp,
        })?;
        validate_write(destination, record)?;

        self.insert(record.clone());
        self.write_log.lock().push(record.clone());
        Ok(())
    }

    async fn install_persistent_rule(&self, rule: &PersistentRule) -> Result<()> {
        self.check(Fault::Install {
            name: rule.name.clone(),
        })?;
        self.rules.write().insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    async fn latest_record(&self, measurement: &str) -> Result<Option<Record>> {
        self.check(Fault::Latest {
            measurement: measurement.to_string(),
        })?;

        let data = self.data.read();
        let latest = data.get(measurement).and_then(|by_tags| {
            by_tags
                .iter()
                .filter_map(|(tags, points)| points.iter().next_back().map(|p| (tags, p)))
                .max_by_key(|(_, (ts, _))| **ts)
        });

        Ok(latest.map(|((platform, stream), (ts, fields))| Record {
            timestamp: *ts,
            measurement: measurement.to_string(),
            platform: platform.clone(),
            stream: stream.clone(),
            fields: fields.clone(),
        }))
    }
}
