//! Scheduler metrics

use sensorhub_telemetry::{Counter, Gauge, Histogram, Metric, MetricSnapshot};

use crate::catchup::CatchUpReport;

#[derive(Clone)]
pub struct SchedulerMetrics {
    pub windows_written: Counter,
    pub catchup_failures: Counter,
    pub catchup_pass_ms: Histogram,
    pub notices_published: Counter,
    pub notice_failures: Counter,
    pub active_notifiers: Gauge,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            windows_written: Counter::new("rollup_windows_written"),
            catchup_failures: Counter::new("rollup_catchup_failures"),
            catchup_pass_ms: Histogram::new("rollup_catchup_pass_ms"),
            notices_published: Counter::new("rollup_notices_published"),
            notice_failures: Counter::new("rollup_notice_failures"),
            active_notifiers: Gauge::new("rollup_active_notifiers"),
        }
    }
}

impl SchedulerMetrics {
    /// Account for one finished catch-up pass
    pub fn record_pass(&self, report: &CatchUpReport, elapsed_ms: f64) {
        self.windows_written.add(report.windows_written() as u64);
        self.catchup_failures.add(report.failures() as u64);
        self.catchup_pass_ms.record(elapsed_ms);
    }

    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let metrics: [&dyn Metric; 6] = [
            &self.windows_written,
            &self.catchup_failures,
            &self.catchup_pass_ms,
            &self.notices_published,
            &self.notice_failures,
            &self.active_notifiers,
        ];
        metrics.iter().map(|m| m.snapshot()).collect()
    }
}
