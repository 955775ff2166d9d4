//! Backlog Catch-Up Engine
//!
//! Replays aggregation over every interval-aligned window a destination is
//! still missing. Progress is never stored here: each pass derives its start
//! point from what the destination actually holds, so a crash, a failed
//! write or a restart simply means the next pass resumes from the same window.
//!
//! Series are processed concurrently; windows within a series strictly in
//! ascending order, each write settling before the next read starts.

use sensorhub_core::{ceil_ts, floor_ts, format_ts, windows, SeriesIdentity, Timestamp, Window};
use sensorhub_tsdb::{AggregateQuery, AggregationRule, TimeSeriesStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::clock::WallClock;
use crate::policy::RollupTarget;
use crate::{Result, SchedulerError};

#[derive(Debug, Clone)]
pub struct SubsampleOptions {
    pub source: String,
    pub destination: String,
    pub interval_ms: i64,
    pub strategy: Vec<AggregationRule>,
    /// Aggregate up through this time, ceiled to the interval. Defaults to now.
    pub end_ts: Option<Timestamp>,
}

impl SubsampleOptions {
    pub fn for_target(target: &RollupTarget) -> Self {
        Self {
            source: target.source.clone(),
            destination: target.destination.clone(),
            interval_ms: target.policy.interval_ms,
            strategy: target.policy.strategy.clone(),
            end_ts: None,
        }
    }

    pub fn with_end_ts(mut self, end_ts: Timestamp) -> Self {
        self.end_ts = Some(end_ts);
        self
    }
}

/// Windows one series still needs: `[start_ts, stop_ts)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpPlan {
    pub start_ts: Timestamp,
    pub stop_ts: Timestamp,
}

impl CatchUpPlan {
    /// `None` when the source series holds no data.
    ///
    /// `end_ts` must already be ceiled to the interval.
    pub fn compute(
        source_first: Option<Timestamp>,
        source_last: Option<Timestamp>,
        destination_last: Option<Timestamp>,
        end_ts: Timestamp,
        interval_ms: i64,
    ) -> Option<Self> {
        let (first, last) = (source_first?, source_last?);
        let start_ts = destination_last.unwrap_or_else(|| floor_ts(first, interval_ms));
        let stop_ts = end_ts.min(floor_ts(last, interval_ms));
        Some(Self { start_ts, stop_ts })
    }

    pub fn is_caught_up(&self) -> bool {
        self.start_ts >= self.stop_ts
    }

    pub fn windows(&self, interval_ms: i64) -> impl Iterator<Item = Window> {
        windows(self.start_ts, self.stop_ts, interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOutcome {
    pub series: SeriesIdentity,
    pub plan: Option<CatchUpPlan>,
    pub windows_written: usize,
    pub windows_empty: usize,
    pub error: Option<String>,
}

impl SeriesOutcome {
    fn new(series: SeriesIdentity) -> Self {
        Self {
            series,
            plan: None,
            windows_written: 0,
            windows_empty: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchUpReport {
    pub source: String,
    pub destination: String,
    pub series: Vec<SeriesOutcome>,
}

impl CatchUpReport {
    pub fn windows_written(&self) -> usize {
        self.series.iter().map(|s| s.windows_written).sum()
    }

    pub fn failures(&self) -> usize {
        self.series.iter().filter(|s| s.error.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }
}

/// Run one catch-up pass from `options.source` into `options.destination`.
///
/// Only listing the source series can fail the pass as a whole; per-series
/// failures are logged and reported in the returned [`CatchUpReport`].
pub async fn subsample(
    store: Arc<dyn TimeSeriesStore>,
    clock: &dyn WallClock,
    options: SubsampleOptions,
) -> Result<CatchUpReport> {
    if options.interval_ms <= 0 {
        return Err(SchedulerError::Config(format!(
            "subsample interval must be positive, got {}ms",
            options.interval_ms
        )));
    }
    if options.strategy.is_empty() {
        return Err(SchedulerError::Config(format!(
            "empty aggregation strategy for {} -> {}",
            options.source, options.destination
        )));
    }

    let end_ts = ceil_ts(options.end_ts.unwrap_or_else(|| clock.now_ms()), options.interval_ms);
    let all_series = store.list_series(&options.source).await?;

    debug!(
        source = %options.source,
        destination = %options.destination,
        series = all_series.len(),
        end = %format_ts(end_ts),
        "Starting catch-up pass"
    );

    let options = Arc::new(options);
    let mut pending: BTreeSet<SeriesIdentity> = all_series.iter().cloned().collect();
    let mut tasks = JoinSet::new();
    for series in all_series {
        tasks.spawn(catch_up_series(store.clone(), options.clone(), series, end_ts));
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                pending.remove(&outcome.series);
                outcomes.push(outcome);
            }
            Err(e) => warn!(source = %options.source, error = %e, "Catch-up task aborted"),
        }
    }
    // Series whose task panicked or was cancelled count as failed
    outcomes.extend(pending.into_iter().map(|series| {
        let mut outcome = SeriesOutcome::new(series);
        outcome.error = Some("catch-up task aborted".to_string());
        outcome
    }));
    outcomes.sort_by(|a, b| a.series.cmp(&b.series));

    let report = CatchUpReport {
        source: options.source.clone(),
        destination: options.destination.clone(),
        series: outcomes,
    };

    info!(
        source = %report.source,
        destination = %report.destination,
        windows_written = report.windows_written(),
        failures = report.failures(),
        "Catch-up pass finished"
    );

    Ok(report)
}

async fn catch_up_series(
    store: Arc<dyn TimeSeriesStore>,
    options: Arc<SubsampleOptions>,
    series: SeriesIdentity,
    end_ts: Timestamp,
) -> SeriesOutcome {
    let mut outcome = SeriesOutcome::new(series.clone());
    let destination_series = series.in_measurement(&options.destination);

    let reads = tokio::try_join!(
        store.first_timestamp(&series),
        store.last_timestamp(&series),
        store.last_timestamp(&destination_series),
    );
    let (source_first, source_last, destination_last) = match reads {
        Ok(timestamps) => timestamps,
        Err(e) => {
            warn!(series = %series, error = %e, "Failed to read series bounds");
            outcome.error = Some(e.to_string());
            return outcome;
        }
    };

    debug!(
        series = %series,
        first = ?source_first.map(format_ts),
        last = ?source_last.map(format_ts),
        destination_last = ?destination_last.map(format_ts),
        "Series bounds"
    );

    let Some(plan) = CatchUpPlan::compute(
        source_first,
        source_last,
        destination_last,
        end_ts,
        options.interval_ms,
    ) else {
        debug!(series = %series, "Source series is empty, skipping");
        return outcome;
    };
    outcome.plan = Some(plan);

    if plan.is_caught_up() {
        debug!(series = %series, "Destination already caught up");
        return outcome;
    }

    debug!(
        series = %series,
        start = %format_ts(plan.start_ts),
        stop = %format_ts(plan.stop_ts),
        "Catching up"
    );

    for window in plan.windows(options.interval_ms) {
        trace!(series = %series, window = %window, "Subsampling window");

        let query = AggregateQuery::new(series.clone(), window, &options.strategy);
        let aggregate = match store.query_aggregate(&query).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!(series = %series, window = %window, error = %e, "Aggregate read failed");
                outcome.error = Some(e.to_string());
                break;
            }
        };

        let Some(mut record) = aggregate else {
            outcome.windows_empty += 1;
            continue;
        };
        record.measurement = options.destination.clone();
        record.timestamp = window.end;

        if let Err(e) = store.write_record(&options.destination, &record).await {
            warn!(series = %series, window = %window, error = %e, "Rollup write failed");
            outcome.error = Some(e.to_string());
            break;
        }
        outcome.windows_written += 1;
    }

    outcome
}
