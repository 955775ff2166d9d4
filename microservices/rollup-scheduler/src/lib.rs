//! Rollup Scheduler
//!
//! Keeps downsampled measurements current:
//! - Installs engine-resident continuous queries per configured rollup
//! - Backfills every interval-aligned window a destination is missing
//! - Publishes the newest rollup just after each interval boundary

pub mod catchup;
pub mod clause;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod installer;
pub mod metrics;
pub mod notifier;
pub mod policy;
pub mod pubsub;
pub mod service;

pub use catchup::{subsample, CatchUpPlan, CatchUpReport, SeriesOutcome, SubsampleOptions};
pub use clause::form_agg_clause;
pub use clock::{FixedClock, SystemClock, WallClock};
pub use config::{MeasurementConfig, MeasurementConfigs, RollupConfig, RollupFile};
pub use dispatch::{notify_latest, refresh_and_notify, setup_all_notices, topic_for, NoticeContext};
pub use error::{Result, SchedulerError};
pub use installer::{create_all_cqs, form_cq_stmt};
pub use metrics::SchedulerMetrics;
pub use notifier::{first_notice_ms, NoticeHandle, NoticeSet, Notifier};
pub use policy::{AggregationPolicy, PolicyRegistry, RollupTarget};
pub use pubsub::{BroadcastHub, PublishError, Publisher};
pub use service::RollupService;
