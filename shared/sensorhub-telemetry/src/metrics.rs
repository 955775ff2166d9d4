//! In-process metric primitives
//!
//! Cheap to clone: clones share the same underlying value, so a metric can be
//! handed to spawned tasks and read back from the service.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Point-in-time value of a named metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub value: f64,
}

pub trait Metric {
    fn snapshot(&self) -> MetricSnapshot;
}

/// Monotonic count of events
#[derive(Clone)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            value: Arc::default(),
        }
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.to_string(),
            value: self.get() as f64,
        }
    }
}

/// Last value set
#[derive(Clone)]
pub struct Gauge {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl Gauge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            value: Arc::default(),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: self.name.to_string(),
            value: self.get() as f64,
        }
    }
}

/// Most recent samples of a measured quantity; older samples are evicted once
/// `capacity` is reached. Snapshots report the median.
#[derive(Clone)]
pub struct Histogram {
    name: Arc<str>,
    capacity: usize,
    samples: Arc<Mutex<VecDeque<f64>>>,
}

impl Histogram {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, 1024)
    }

    pub fn with_capacity(name: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
        }
    }

    pub fn record(&self, value: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    /// Nearest-rank percentile, `0.0` when nothing was recorded
    pub fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(f64::total_cmp);
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

impl Metric for Histogram {
    fn snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            name: format!("{}_p50", self.name),
            value: self.percentile(50.0),
        }
    }
}
