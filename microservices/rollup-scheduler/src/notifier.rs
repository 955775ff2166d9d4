//! Boundary-Aligned Notifier
//!
//! Fires a callback just after every absolute interval boundary (multiples of
//! the interval from the UNIX epoch) plus a fixed settle delay, passing it the
//! boundary that just closed. The first
//! firing is computed from the wall clock; after that the task runs on a
//! fixed-rate tokio interval anchored to the first firing, so slow callbacks
//! never push later firings off the boundary.
//!
//! A large wall-clock jump is not corrected: the schedule keeps its monotonic
//! anchor until the process restarts.

use sensorhub_core::{format_ts, Timestamp};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::WallClock;
use crate::{Result, SchedulerError};

/// Wall-clock time of the first firing: the next boundary at or after `now`,
/// plus `delay_ms`. `None` if that overflows.
pub fn first_notice_ms(now_ms: Timestamp, interval_ms: i64, delay_ms: i64) -> Option<Timestamp> {
    let boundary = now_ms.div_euclid(interval_ms).checked_mul(interval_ms)?;
    let next = if boundary == now_ms {
        now_ms
    } else {
        boundary.checked_add(interval_ms)?
    };
    next.checked_add(delay_ms)
}

/// Handle to one running notifier
pub struct NoticeHandle {
    name: String,
    first_notice: Timestamp,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NoticeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock time of the first firing
    pub fn first_notice(&self) -> Timestamp {
        self.first_notice
    }

    /// Stop the pending first firing and every later one. A callback that is
    /// already running is allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the notifier task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            debug!(notifier = %self.name, error = %e, "Notifier task ended abnormally");
        }
    }
}

pub struct Notifier;

impl Notifier {
    /// Start a notifier firing every `interval_ms`, `delay_ms` after each
    /// boundary. The callback receives the boundary it fires for.
    pub fn start<F, Fut>(
        name: impl Into<String>,
        clock: &dyn WallClock,
        interval_ms: u64,
        delay_ms: u64,
        mut callback: F,
    ) -> Result<NoticeHandle>
    where
        F: FnMut(Timestamp) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if interval_ms == 0 {
            return Err(SchedulerError::Config(format!(
                "notifier '{}' needs a positive interval",
                name
            )));
        }

        let out_of_range = || {
            SchedulerError::Config(format!(
                "notifier '{}' schedule out of range: interval {}ms, delay {}ms",
                name, interval_ms, delay_ms
            ))
        };
        let interval = i64::try_from(interval_ms).map_err(|_| out_of_range())?;
        let delay = i64::try_from(delay_ms).map_err(|_| out_of_range())?;

        let now = clock.now_ms();
        let first_notice = first_notice_ms(now, interval, delay).ok_or_else(out_of_range)?;
        let first_boundary = first_notice - delay;
        let period = Duration::from_millis(interval_ms);
        let first_at = Instant::now()
            .checked_add(Duration::from_millis((first_notice - now).max(0) as u64))
            .ok_or_else(out_of_range)?;

        info!(
            notifier = %name,
            interval_ms,
            delay_ms,
            first_notice = %format_ts(first_notice),
            "Notifier scheduled"
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(notifier = %task_name, "Notifier cancelled before first notice");
                    return;
                }
                _ = tokio::time::sleep_until(first_at) => {}
            }

            callback(first_boundary).await;

            let mut ticker = tokio::time::interval_at(first_at + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let at = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    at = ticker.tick() => at,
                };
                // Skipped ticks stay on the grid, so this is a whole number of periods
                let periods = (at - first_at).as_millis() / u128::from(interval_ms);
                let boundary = i64::try_from(periods)
                    .ok()
                    .and_then(|n| n.checked_mul(interval))
                    .and_then(|offset| first_boundary.checked_add(offset));
                let Some(boundary) = boundary else {
                    warn!(notifier = %task_name, "Boundary out of range, stopping");
                    break;
                };
                callback(boundary).await;
            }

            debug!(notifier = %task_name, "Notifier stopped");
        });

        Ok(NoticeHandle {
            name,
            first_notice,
            cancel,
            task,
        })
    }
}

/// Every notifier owned by the running service
#[derive(Default)]
pub struct NoticeSet {
    handles: Vec<NoticeHandle>,
}

impl NoticeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: NoticeHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.name()).collect()
    }

    pub fn handles(&self) -> &[NoticeHandle] {
        &self.handles
    }

    pub fn cancel_all(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    /// Cancel every notifier and wait for all of them to exit
    pub async fn shutdown(self) {
        self.cancel_all();
        let count = self.handles.len();
        for handle in self.handles {
            handle.join().await;
        }
        info!(notifiers = count, "All notifiers stopped");
    }
}
