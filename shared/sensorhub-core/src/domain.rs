//! Core time-series domain types used across all microservices

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the UNIX epoch
pub type Timestamp = i64;

/// Round `ts` down to the nearest multiple of `interval` (aligned from epoch 0)
pub fn floor_ts(ts: Timestamp, interval: i64) -> Timestamp {
    debug_assert!(interval > 0);
    ts.div_euclid(interval) * interval
}

/// Round `ts` up to the nearest multiple of `interval` (aligned from epoch 0)
pub fn ceil_ts(ts: Timestamp, interval: i64) -> Timestamp {
    let floored = floor_ts(ts, interval);
    if floored == ts {
        ts
    } else {
        floored + interval
    }
}

/// Render a timestamp for logs
pub fn format_ts(ts: Timestamp) -> String {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt.to_rfc3339(),
        None => ts.to_string(),
    }
}

/// Half-open, interval-aligned time slice `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_ts(self.start), format_ts(self.end))
    }
}

/// Contiguous ascending windows covering `[start, stop)`, one per `interval`.
///
/// `start` is expected to already sit on a boundary; the last window may end
/// past `stop` only if `stop` itself is unaligned.
pub fn windows(start: Timestamp, stop: Timestamp, interval: i64) -> impl Iterator<Item = Window> {
    debug_assert!(interval > 0);
    let mut next = start;
    std::iter::from_fn(move || {
        if next >= stop {
            return None;
        }
        let window = Window {
            start: next,
            end: next + interval,
        };
        next += interval;
        Some(window)
    })
}

/// Identity of one series within a measurement.
///
/// Platform and stream are optional partitioning tags; absent means the
/// series is unpartitioned. A rollup series carries the tags of the raw
/// series it was derived from, see [`SeriesIdentity::in_measurement`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesIdentity {
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl SeriesIdentity {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            platform: None,
            stream: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// The corresponding series in another measurement
    pub fn in_measurement(&self, measurement: &str) -> SeriesIdentity {
        SeriesIdentity {
            measurement: measurement.to_string(),
            platform: self.platform.clone(),
            stream: self.stream.clone(),
        }
    }
}

impl fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.measurement)?;
        if let Some(platform) = &self.platform {
            write!(f, ",platform={}", platform)?;
        }
        if let Some(stream) = &self.stream {
            write!(f, ",stream={}", stream)?;
        }
        Ok(())
    }
}

/// One timestamped packet of observations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: Timestamp,
    pub measurement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub fields: BTreeMap<String, f64>,
}

impl Record {
    pub fn new(series: &SeriesIdentity, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            measurement: series.measurement.clone(),
            platform: series.platform.clone(),
            stream: series.stream.clone(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}
