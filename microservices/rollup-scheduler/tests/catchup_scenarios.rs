//! End-to-end catch-up and dispatch scenarios over the in-process store

use async_trait::async_trait;
use parking_lot::Mutex;
use rollup_scheduler::{
    notify_latest, setup_all_notices, subsample, FixedClock, NoticeContext, PolicyRegistry, PublishError,
    Publisher, RollupFile, SchedulerMetrics, SubsampleOptions,
};
use sensorhub_core::{Record, SeriesIdentity, Timestamp};
use sensorhub_tsdb::{AggregationRule, Fault, MemoryStore, TimeSeriesStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const MINUTE: i64 = 60_000;

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Record)>>,
}

impl RecordingPublisher {
    fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    fn timestamps(&self) -> Vec<Timestamp> {
        self.published.lock().iter().map(|(_, r)| r.timestamp).collect()
    }

    fn last(&self) -> Option<Record> {
        self.published.lock().last().map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &Record) -> Result<(), PublishError> {
        self.published.lock().push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

fn console() -> SeriesIdentity {
    SeriesIdentity::new("wxpackets").with_platform("console")
}

fn seed(store: &MemoryStore, series: &SeriesIdentity, points: impl IntoIterator<Item = (Timestamp, f64)>) {
    for (ts, temperature) in points {
        store.insert(Record::new(series, ts).with_field("out_temperature", temperature));
    }
}

/// One point every 10 seconds over the first ten minutes, plus one at 10:00
fn seed_ten_minutes(store: &MemoryStore, series: &SeriesIdentity) {
    seed(store, series, (0..=60).map(|i| (i * 10_000, i as f64)));
}

fn options() -> SubsampleOptions {
    SubsampleOptions {
        source: "wxpackets".to_string(),
        destination: "wx_1m".to_string(),
        interval_ms: MINUTE,
        strategy: vec![
            AggregationRule::new("out_temperature", "mean(out_temperature)"),
            AggregationRule::new("out_temperature_max", "max(out_temperature)"),
        ],
        end_ts: None,
    }
}

fn written_timestamps(store: &MemoryStore) -> Vec<Timestamp> {
    store.written("wx_1m").iter().map(|r| r.timestamp).collect()
}

fn notice_context(store: Arc<MemoryStore>, publisher: Arc<RecordingPublisher>, now_ms: Timestamp) -> NoticeContext {
    NoticeContext {
        store,
        publisher,
        clock: Arc::new(FixedClock::new(now_ms)),
        metrics: SchedulerMetrics::default(),
    }
}

#[tokio::test]
async fn test_windows_written_in_ascending_order() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert!(report.is_complete());
    assert_eq!(report.windows_written(), 10);

    let expected: Vec<Timestamp> = (1..=10).map(|k| k * MINUTE).collect();
    assert_eq!(written_timestamps(&store), expected);

    let first = &store.written("wx_1m")[0];
    assert_eq!(first.platform.as_deref(), Some("console"));
    assert_eq!(first.fields["out_temperature"], 2.5);
    assert_eq!(first.fields["out_temperature_max"], 5.0);
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    assert_ok!(subsample(store.clone(), &clock, options()).await);
    let writes = store.write_count();

    let again = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert_eq!(again.windows_written(), 0);
    assert!(again.series[0].plan.unwrap().is_caught_up());
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn test_failed_write_resumes_from_same_window() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    // Fourth window, [3:00, 4:00)
    store.inject(Fault::WriteAt {
        measurement: "wx_1m".to_string(),
        timestamp: 4 * MINUTE,
    });

    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert_eq!(report.windows_written(), 3);
    assert_eq!(report.failures(), 1);
    assert_eq!(written_timestamps(&store), vec![MINUTE, 2 * MINUTE, 3 * MINUTE]);

    store.clear_faults();
    let resumed = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert!(resumed.is_complete());
    assert_eq!(resumed.series[0].plan.unwrap().start_ts, 3 * MINUTE);
    assert_eq!(resumed.windows_written(), 7);

    let expected: Vec<Timestamp> = (1..=10).map(|k| k * MINUTE).collect();
    assert_eq!(written_timestamps(&store), expected);
}

#[tokio::test]
async fn test_failed_aggregate_resumes_from_same_window() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    // Aggregate read for [3:00, 4:00)
    store.inject(Fault::AggregateAt {
        measurement: "wxpackets".to_string(),
        window_end: 4 * MINUTE,
    });

    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert_eq!(report.windows_written(), 3);
    assert_eq!(report.failures(), 1);
    assert_eq!(written_timestamps(&store), vec![MINUTE, 2 * MINUTE, 3 * MINUTE]);

    store.clear_faults();
    let resumed = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert!(resumed.is_complete());
    assert_eq!(resumed.series[0].plan.unwrap().start_ts, 3 * MINUTE);
    assert_eq!(resumed.windows_written(), 7);
    assert_eq!(written_timestamps(&store)[3], 4 * MINUTE);
}

#[tokio::test]
async fn test_failed_bounds_read_skips_the_series() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    // Source bounds, then the destination's last timestamp
    for measurement in ["wxpackets", "wx_1m"] {
        store.inject(Fault::Bounds {
            measurement: measurement.to_string(),
        });
        let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
        assert_eq!(report.series.len(), 1);
        assert_eq!(report.failures(), 1);
        assert!(report.series[0].plan.is_none());
        assert_eq!(store.write_count(), 0);
        store.clear_faults();
    }

    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert!(report.is_complete());
    assert_eq!(report.windows_written(), 10);
}

#[tokio::test]
async fn test_two_minute_example() {
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        &console(),
        [(0, 10.0), (30_000, 20.0), (60_000, 30.0), (90_000, 40.0), (120_000, 50.0)],
    );
    let clock = FixedClock::new(0);

    let report = assert_ok!(subsample(store.clone(), &clock, options().with_end_ts(2 * MINUTE)).await);
    assert_eq!(report.windows_written(), 2);

    let written = store.written("wx_1m");
    assert_eq!(written[0].timestamp, MINUTE);
    assert_eq!(written[0].fields["out_temperature"], 15.0);
    assert_eq!(written[1].timestamp, 2 * MINUTE);
    assert_eq!(written[1].fields["out_temperature"], 35.0);
}

#[tokio::test]
async fn test_end_ts_caps_the_pass() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);

    // Ceiled up to 3:00
    let report = assert_ok!(subsample(store.clone(), &clock, options().with_end_ts(170_000)).await);
    assert_eq!(report.windows_written(), 3);
    assert_eq!(written_timestamps(&store), vec![MINUTE, 2 * MINUTE, 3 * MINUTE]);
}

#[tokio::test]
async fn test_series_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let console = console();
    let outdoor = SeriesIdentity::new("wxpackets").with_platform("outdoor");
    seed_ten_minutes(&store, &console);
    seed(&store, &outdoor, (30..=60).map(|i| (i * 10_000, 100.0)));

    store.inject(Fault::WriteAt {
        measurement: "wx_1m".to_string(),
        timestamp: 2 * MINUTE,
    });

    let clock = FixedClock::new(3_600_000);
    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);

    let by_platform = |name: &str| {
        report
            .series
            .iter()
            .find(|s| s.series.platform.as_deref() == Some(name))
            .unwrap()
            .clone()
    };
    let failed = by_platform("console");
    assert_eq!(failed.windows_written, 1);
    assert!(failed.error.is_some());

    let healthy = by_platform("outdoor");
    assert_eq!(healthy.windows_written, 5);
    assert!(healthy.error.is_none());

    let outdoor_rollup = outdoor.in_measurement("wx_1m");
    assert_eq!(assert_ok!(store.last_timestamp(&outdoor_rollup).await), Some(10 * MINUTE));
}

#[tokio::test]
async fn test_empty_source_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let clock = FixedClock::new(3_600_000);

    let report = assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert!(report.series.is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn test_listing_failure_fails_the_pass() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    store.inject(Fault::ListSeries {
        measurement: "wxpackets".to_string(),
    });

    let clock = FixedClock::new(3_600_000);
    assert!(subsample(store.clone(), &clock, options()).await.is_err());
}

#[tokio::test]
async fn test_latest_rollup_published_after_catch_up() {
    let store = Arc::new(MemoryStore::new());
    seed_ten_minutes(&store, &console());
    let clock = FixedClock::new(3_600_000);
    assert_ok!(subsample(store.clone(), &clock, options()).await);

    let publisher = RecordingPublisher::default();
    let published = assert_ok!(notify_latest(store.as_ref(), &publisher, "wx_1m").await);
    assert_eq!(published, Some(10 * MINUTE));
    assert_eq!(publisher.topics(), vec!["/wx_1m".to_string()]);
    assert_eq!(publisher.last().unwrap().fields["out_temperature"], 56.5);
}

const FILE: &str = r#"
measurements:
  wxpackets:
    database: weather
    cqs:
      - cq_policy: wx_1m
        cq_destination: wx_1m
        cq_name: cq_wx_1m
cq_policies:
  wx_1m:
    interval: 60000
    aggregation:
      - obs_type: out_temperature
        subsample: mean(out_temperature)
"#;

#[tokio::test(start_paused = true)]
async fn test_notices_publish_after_each_boundary() {
    let file = assert_ok!(RollupFile::from_yaml(FILE));
    let registry = assert_ok!(PolicyRegistry::from_config(&file.cq_policies));

    let store = Arc::new(MemoryStore::new());
    seed(&store, &console().in_measurement("wx_1m"), [(MINUTE, 1.0), (2 * MINUTE, 2.0)]);
    let publisher = Arc::new(RecordingPublisher::default());

    // 30s before the 3:00 boundary, settle delay 5s: first firing at 3:05
    let ctx = notice_context(store.clone(), publisher.clone(), 150_000);
    let metrics = ctx.metrics.clone();
    let notices = assert_ok!(setup_all_notices(ctx, &file.measurements, &registry, 5_000));
    assert_eq!(notices.names(), vec!["cq_wx_1m"]);
    assert_eq!(notices.handles()[0].first_notice(), 185_000);
    assert_eq!(metrics.active_notifiers.get(), 1);

    tokio::time::sleep(Duration::from_millis(30_000)).await;
    assert!(publisher.topics().is_empty());

    tokio::time::sleep(Duration::from_millis(6_000)).await;
    assert_eq!(publisher.topics(), vec!["/wx_1m".to_string()]);
    assert_eq!(publisher.last().unwrap().timestamp, 2 * MINUTE);

    store.insert(
        Record::new(&console().in_measurement("wx_1m"), 3 * MINUTE).with_field("out_temperature", 3.0),
    );
    tokio::time::sleep(Duration::from_millis(MINUTE as u64)).await;
    assert_eq!(publisher.topics().len(), 2);
    assert_eq!(publisher.last().unwrap().timestamp, 3 * MINUTE);
    assert_eq!(metrics.notices_published.get(), 2);

    notices.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_notice_failures_do_not_stop_the_schedule() {
    let file = assert_ok!(RollupFile::from_yaml(FILE));
    let registry = assert_ok!(PolicyRegistry::from_config(&file.cq_policies));

    let store = Arc::new(MemoryStore::new());
    seed(&store, &console().in_measurement("wx_1m"), [(MINUTE, 1.0)]);
    store.inject(Fault::Latest {
        measurement: "wx_1m".to_string(),
    });
    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = notice_context(store.clone(), publisher.clone(), 0);
    let metrics = ctx.metrics.clone();

    let notices = assert_ok!(setup_all_notices(ctx, &file.measurements, &registry, 0));

    // Firings at 0 and 1:00 both fail
    tokio::time::sleep(Duration::from_millis(MINUTE as u64 + 1_000)).await;
    assert_eq!(metrics.notice_failures.get(), 2);
    assert!(publisher.topics().is_empty());

    store.clear_faults();
    tokio::time::sleep(Duration::from_millis(MINUTE as u64)).await;
    assert_eq!(publisher.topics().len(), 1);

    notices.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_published_rollups_advance_past_startup_catch_up() {
    let file = assert_ok!(RollupFile::from_yaml(FILE));
    let registry = assert_ok!(PolicyRegistry::from_config(&file.cq_policies));

    // Raw data through 3:00, caught up at startup
    let store = Arc::new(MemoryStore::new());
    seed(&store, &console(), (0..=18).map(|i| (i * 10_000, 1.0)));
    let clock = FixedClock::new(200_000);
    assert_ok!(subsample(store.clone(), &clock, options()).await);
    assert_eq!(written_timestamps(&store), vec![MINUTE, 2 * MINUTE, 3 * MINUTE]);

    let publisher = Arc::new(RecordingPublisher::default());
    let ctx = notice_context(store.clone(), publisher.clone(), 200_000);
    let metrics = ctx.metrics.clone();
    let notices = assert_ok!(setup_all_notices(ctx, &file.measurements, &registry, 5_000));

    // Five more minutes of raw data keep arriving
    seed(&store, &console(), (19..=48).map(|i| (i * 10_000, 2.0)));

    // First firing at 4:05, then every minute
    tokio::time::sleep(Duration::from_millis(45_000 + 1_000)).await;
    tokio::time::sleep(Duration::from_millis(4 * MINUTE as u64)).await;

    let expected: Vec<Timestamp> = (4..=8).map(|k| k * MINUTE).collect();
    assert_eq!(publisher.timestamps(), expected);
    assert_eq!(written_timestamps(&store), (1..=8).map(|k| k * MINUTE).collect::<Vec<_>>());
    assert_eq!(metrics.windows_written.get(), 5);
    assert_eq!(metrics.notices_published.get(), 5);

    notices.shutdown().await;
}
