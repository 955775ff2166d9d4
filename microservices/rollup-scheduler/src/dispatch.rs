//! Latest-Value Dispatcher
//!
//! Just after each interval boundary settles, the destination is brought up
//! to that boundary and its newest rollup is published on `/<destination>`
//! for live subscribers.

use sensorhub_core::{format_ts, Timestamp};
use sensorhub_tsdb::TimeSeriesStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catchup::{subsample, SubsampleOptions};
use crate::clock::WallClock;
use crate::config::MeasurementConfigs;
use crate::metrics::SchedulerMetrics;
use crate::notifier::{NoticeSet, Notifier};
use crate::policy::{PolicyRegistry, RollupTarget};
use crate::pubsub::Publisher;
use crate::Result;

/// Topic a destination's rollups are published on
pub fn topic_for(destination: &str) -> String {
    format!("/{}", destination)
}

/// Publish the newest record of `destination`.
///
/// Returns the timestamp of what was published, or `None` when the
/// destination holds nothing yet.
pub async fn notify_latest(
    store: &dyn TimeSeriesStore,
    publisher: &dyn Publisher,
    destination: &str,
) -> Result<Option<Timestamp>> {
    let Some(record) = store.latest_record(destination).await? else {
        debug!(destination, "No rollup to publish yet");
        return Ok(None);
    };

    let topic = topic_for(destination);
    publisher.publish(&topic, &record).await?;
    debug!(topic = %topic, timestamp = %format_ts(record.timestamp), "Latest rollup published");
    Ok(Some(record.timestamp))
}

/// Shared state every notifier callback works from
#[derive(Clone)]
pub struct NoticeContext {
    pub store: Arc<dyn TimeSeriesStore>,
    pub publisher: Arc<dyn Publisher>,
    pub clock: Arc<dyn WallClock>,
    pub metrics: SchedulerMetrics,
}

/// Aggregate every window of `target` that closed by `boundary`, then publish
/// the destination's newest record. A failed refresh is logged and the
/// publish still goes ahead with whatever the destination holds.
pub async fn refresh_and_notify(
    ctx: &NoticeContext,
    target: &RollupTarget,
    boundary: Timestamp,
) -> Option<Timestamp> {
    let started = Instant::now();
    let options = SubsampleOptions::for_target(target).with_end_ts(boundary);
    match subsample(ctx.store.clone(), ctx.clock.as_ref(), options).await {
        Ok(report) => {
            ctx.metrics
                .record_pass(&report, started.elapsed().as_secs_f64() * 1_000.0);
        }
        Err(e) => {
            ctx.metrics.catchup_failures.inc();
            warn!(
                destination = %target.destination,
                boundary = %format_ts(boundary),
                error = %e,
                "Rollup refresh failed"
            );
        }
    }

    match notify_latest(ctx.store.as_ref(), ctx.publisher.as_ref(), &target.destination).await {
        Ok(published) => {
            if published.is_some() {
                ctx.metrics.notices_published.inc();
            }
            published
        }
        Err(e) => {
            ctx.metrics.notice_failures.inc();
            warn!(destination = %target.destination, error = %e, "Latest rollup notice failed");
            None
        }
    }
}

/// Start one notifier per configured continuous query. Each firing runs
/// [`refresh_and_notify`] for the boundary that just closed; failures are
/// logged and the schedule carries on.
pub fn setup_all_notices(
    ctx: NoticeContext,
    measurements: &MeasurementConfigs,
    registry: &PolicyRegistry,
    cq_delay_ms: u64,
) -> Result<NoticeSet> {
    let mut notices = NoticeSet::new();

    for target in registry.targets(measurements)? {
        let target = Arc::new(target);
        let interval_ms = u64::try_from(target.policy.interval_ms).unwrap_or_default();
        let callback = {
            let ctx = ctx.clone();
            let target = target.clone();
            move |boundary| {
                let ctx = ctx.clone();
                let target = target.clone();
                async move {
                    refresh_and_notify(&ctx, &target, boundary).await;
                }
            }
        };

        let handle = Notifier::start(
            target.rule_name.clone(),
            ctx.clock.as_ref(),
            interval_ms,
            cq_delay_ms,
            callback,
        );
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                notices.cancel_all();
                return Err(e);
            }
        };
        notices.push(handle);
    }

    ctx.metrics.active_notifiers.set(notices.len() as u64);
    info!(notifiers = notices.len(), delay_ms = cq_delay_ms, "Rollup notifiers started");
    Ok(notices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::policy::AggregationPolicy;
    use crate::pubsub::{BroadcastHub, PublishError};
    use async_trait::async_trait;
    use sensorhub_core::{Record, SeriesIdentity};
    use sensorhub_tsdb::{AggregationRule, Fault, MemoryStore};

    struct RefusingPublisher;

    #[async_trait]
    impl Publisher for RefusingPublisher {
        async fn publish(&self, topic: &str, _payload: &Record) -> std::result::Result<(), PublishError> {
            Err(PublishError::Transport(format!("{} unreachable", topic)))
        }
    }

    fn rollup(ts: Timestamp, temperature: f64) -> Record {
        Record::new(&SeriesIdentity::new("wx_5m"), ts).with_field("out_temperature", temperature)
    }

    fn target() -> RollupTarget {
        let policy = AggregationPolicy::new(
            "wx_1m",
            60_000,
            vec![AggregationRule::new("out_temperature", "mean(out_temperature)")],
        )
        .unwrap();
        RollupTarget {
            source: "wxpackets".to_string(),
            database: "weather".to_string(),
            retention_policy: "autogen".to_string(),
            qualified_source: "weather.autogen.wxpackets".to_string(),
            destination: "wx_1m".to_string(),
            rule_name: "cq_wx_1m".to_string(),
            policy: Arc::new(policy),
        }
    }

    fn context(store: Arc<MemoryStore>, hub: Arc<BroadcastHub>) -> NoticeContext {
        NoticeContext {
            store,
            publisher: hub,
            clock: Arc::new(FixedClock::new(0)),
            metrics: SchedulerMetrics::default(),
        }
    }

    #[test]
    fn test_topic_for() {
        assert_eq!(topic_for("wxpackets_5m"), "/wxpackets_5m");
    }

    #[tokio::test]
    async fn test_publishes_newest_record() {
        let store = MemoryStore::new();
        store.insert(rollup(300_000, 20.0));
        store.insert(rollup(600_000, 21.5));

        let hub = BroadcastHub::new(4);
        let mut rx = hub.subscribe("/wx_5m");

        let published = notify_latest(&store, &hub, "wx_5m").await.unwrap();
        assert_eq!(published, Some(600_000));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.fields["out_temperature"], 21.5);
    }

    #[tokio::test]
    async fn test_empty_destination_publishes_nothing() {
        let store = MemoryStore::new();
        let hub = BroadcastHub::new(4);
        let mut rx = hub.subscribe("/wx_5m");

        assert_eq!(notify_latest(&store, &hub, "wx_5m").await.unwrap(), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failures_surface_as_errors() {
        let store = MemoryStore::new();
        store.insert(rollup(300_000, 20.0));
        assert!(notify_latest(&store, &RefusingPublisher, "wx_5m").await.is_err());

        store.inject(Fault::Latest {
            measurement: "wx_5m".to_string(),
        });
        let hub = BroadcastHub::new(4);
        assert!(notify_latest(&store, &hub, "wx_5m").await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_writes_closed_window_before_publishing() {
        let store = Arc::new(MemoryStore::new());
        let raw = SeriesIdentity::new("wxpackets").with_platform("roof");
        for ts in (0..=130_000).step_by(10_000) {
            store.insert(Record::new(&raw, ts).with_field("out_temperature", 20.0));
        }
        let hub = Arc::new(BroadcastHub::new(4));
        let mut rx = hub.subscribe("/wx_1m");
        let ctx = context(store.clone(), hub.clone());

        // Only windows that closed by the boundary are written
        let published = refresh_and_notify(&ctx, &target(), 60_000).await;
        assert_eq!(published, Some(60_000));
        assert_eq!(store.write_count(), 1);

        let published = refresh_and_notify(&ctx, &target(), 120_000).await;
        assert_eq!(published, Some(120_000));
        assert_eq!(rx.recv().await.unwrap().timestamp, 60_000);
        assert_eq!(rx.recv().await.unwrap().timestamp, 120_000);
        assert_eq!(ctx.metrics.windows_written.get(), 2);
        assert_eq!(ctx.metrics.notices_published.get(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_still_publishes() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Record::new(&SeriesIdentity::new("wx_1m"), 60_000).with_field("out_temperature", 20.0));
        store.inject(Fault::ListSeries {
            measurement: "wxpackets".to_string(),
        });
        let hub = Arc::new(BroadcastHub::new(4));
        let ctx = context(store, hub);

        assert_eq!(refresh_and_notify(&ctx, &target(), 120_000).await, Some(60_000));
        assert_eq!(ctx.metrics.catchup_failures.get(), 1);
        assert_eq!(ctx.metrics.notices_published.get(), 1);
    }
}
