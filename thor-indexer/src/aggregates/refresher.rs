//! Background rollup refresher
//!
//! `Idle -> Refreshing(Bulk | Incremental) -> Idle`. A cycle covers at most
//! `max_window` nanoseconds of chain time. When the commit point is further
//! away than that the cycle is Bulk, makes partial progress and is repeated
//! right away until the views converge.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::trigger::{Trigger, TriggerReceiver};
use super::views::AggregateView;
use crate::core::{AggregatePort, StorageError};
use crate::metrics::Metrics;
use crate::sync::block_track::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Gap larger than one window, partial progress
    Bulk,
    /// Gap fits in one window
    Incremental,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Bulk => "bulk",
            RefreshMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherState {
    Idle,
    Refreshing(RefreshMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub mode: RefreshMode,
    /// Views rewritten by this cycle, zero when already up to date
    pub views_refreshed: usize,
    pub last_aggregated: i64,
    pub caught_up: bool,
}

pub struct AggregateRefresher {
    store: Arc<dyn AggregatePort>,
    views: Vec<AggregateView>,
    max_window: i64,
    interval: Duration,
    last_aggregated: Option<i64>,
    state: RefresherState,
    caught_up: Option<Trigger>,
    metrics: Option<Arc<Metrics>>,
}

impl AggregateRefresher {
    pub fn new(store: Arc<dyn AggregatePort>, max_window: i64, interval: Duration) -> Self {
        Self {
            store,
            views: AggregateView::all(),
            max_window: max_window.max(1),
            interval,
            last_aggregated: None,
            state: RefresherState::Idle,
            caught_up: None,
            metrics: None,
        }
    }

    /// Signal fired each time a refresh run converges
    pub fn with_caught_up(mut self, trigger: Trigger) -> Self {
        self.caught_up = Some(trigger);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> RefresherState {
        self.state
    }

    pub fn last_aggregated(&self) -> Option<i64> {
        self.last_aggregated
    }

    /// Resume point: the oldest view watermark, or the first block when no
    /// view has been materialized yet
    async fn start_point(&self) -> Result<Option<i64>, StorageError> {
        let mut oldest: Option<i64> = None;
        for view in &self.views {
            match self.store.watermark(&view.name()).await? {
                Some(watermark) => oldest = Some(oldest.map_or(watermark, |o| o.min(watermark))),
                None => return self.store.earliest_block_timestamp().await,
            }
        }
        Ok(oldest)
    }

    /// One bounded cycle toward `target` (exclusive, nanoseconds)
    pub async fn refresh_once(&mut self, target: i64) -> Result<RefreshOutcome, StorageError> {
        let from = match self.last_aggregated {
            Some(from) => from,
            None => match self.start_point().await? {
                Some(from) => {
                    self.last_aggregated = Some(from);
                    from
                }
                None => {
                    return Ok(RefreshOutcome {
                        mode: RefreshMode::Incremental,
                        views_refreshed: 0,
                        last_aggregated: target,
                        caught_up: true,
                    })
                }
            },
        };

        if target <= from {
            return Ok(RefreshOutcome {
                mode: RefreshMode::Incremental,
                views_refreshed: 0,
                last_aggregated: from,
                caught_up: true,
            });
        }

        let mode = if target - from > self.max_window {
            RefreshMode::Bulk
        } else {
            RefreshMode::Incremental
        };
        let to = target.min(from.saturating_add(self.max_window));
        self.state = RefresherState::Refreshing(mode);

        let result = self.refresh_views(from, to).await;
        self.state = RefresherState::Idle;
        result?;

        let last = self.last_aggregated.map_or(to, |last| last.max(to));
        self.last_aggregated = Some(last);
        if let Some(metrics) = &self.metrics {
            metrics.refresh_cycles.with_label_values(&[mode.as_str()]).inc();
        }
        debug!(from, to, mode = mode.as_str(), "Aggregates refreshed");

        Ok(RefreshOutcome {
            mode,
            views_refreshed: self.views.len(),
            last_aggregated: last,
            caught_up: to >= target,
        })
    }

    async fn refresh_views(&self, from: i64, to: i64) -> Result<(), StorageError> {
        for view in &self.views {
            let start = view.bucket.floor(from);
            let watermark = view.bucket.floor(to);
            self.store.refresh_view(view, start, to, watermark).await?;
        }
        Ok(())
    }

    /// Repeats cycles until converged; fires the caught-up signal when any
    /// work was done
    pub async fn converge(&mut self, target: i64, cancel: &CancellationToken) -> Result<bool, StorageError> {
        let mut worked = false;
        loop {
            let outcome = self.refresh_once(target).await?;
            worked |= outcome.views_refreshed > 0;
            if outcome.caught_up {
                if worked {
                    if let Some(trigger) = &self.caught_up {
                        trigger.fire();
                    }
                }
                return Ok(true);
            }
            if cancel.is_cancelled() {
                return Ok(false);
            }
        }
    }

    /// Runs on commit triggers and on the fallback interval until cancelled.
    /// The target is the latest committed block.
    pub async fn run(
        mut self,
        mut triggers: TriggerReceiver,
        mut commits: watch::Receiver<Option<Snapshot>>,
        cancel: CancellationToken,
    ) {
        info!(
            views = self.views.len(),
            interval_secs = self.interval.as_secs(),
            "Aggregate refresher started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = triggers.recv(), if triggers_open => {
                    if signal.is_none() {
                        triggers_open = false;
                        continue;
                    }
                }
                _ = ticker.tick() => {}
            }

            let target = match commits.borrow_and_update().as_ref() {
                Some(track) => track.timestamp.saturating_add(1),
                None => continue,
            };
            if let Err(e) = self.converge(target, &cancel).await {
                warn!(error = %e, "Aggregate refresh failed, retrying on next trigger");
            }
        }
        info!("Aggregate refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::trigger::coalescing;
    use crate::aggregates::views::NANOS_PER_SECOND;
    use crate::database::MemoryStore;

    const DAY: i64 = 86_400 * NANOS_PER_SECOND;

    #[tokio::test]
    async fn nothing_to_do_without_blocks() {
        let store = Arc::new(MemoryStore::new());
        let mut refresher = AggregateRefresher::new(store.clone(), DAY, Duration::from_secs(1));
        let outcome = refresher.refresh_once(5 * DAY).await.unwrap();
        assert!(outcome.caught_up);
        assert_eq!(outcome.views_refreshed, 0);
        assert!(store.refreshes().await.is_empty());
    }

    #[tokio::test]
    async fn resumes_from_oldest_watermark() {
        let store = Arc::new(MemoryStore::new());
        for view in AggregateView::all() {
            store.set_watermark(&view.name(), 3 * DAY).await;
        }
        store.set_watermark("depths_5min", 2 * DAY).await;
        let mut refresher = AggregateRefresher::new(store.clone(), 10 * DAY, Duration::from_secs(1));
        let outcome = refresher.refresh_once(4 * DAY).await.unwrap();
        assert_eq!(outcome.mode, RefreshMode::Incremental);
        assert!(outcome.caught_up);
        let first = &store.refreshes().await[0];
        assert_eq!((first.from, first.to), (2 * DAY, 4 * DAY));
    }

    #[tokio::test]
    async fn converge_fires_caught_up_once() {
        let store = Arc::new(MemoryStore::new());
        for view in AggregateView::all() {
            store.set_watermark(&view.name(), 0).await;
        }
        let (trigger, mut rx) = coalescing();
        let mut refresher =
            AggregateRefresher::new(store.clone(), DAY, Duration::from_secs(1)).with_caught_up(trigger);
        let cancel = CancellationToken::new();

        assert!(refresher.converge(3 * DAY + 5, &cancel).await.unwrap());
        assert!(rx.try_recv());
        assert_eq!(refresher.state(), RefresherState::Idle);

        // Already converged: no work, no notification
        assert!(refresher.converge(3 * DAY + 5, &cancel).await.unwrap());
        assert!(!rx.try_recv());
    }

    #[tokio::test]
    async fn only_coalesced_notifications_count_as_dropped() {
        let store = Arc::new(MemoryStore::new());
        for view in AggregateView::all() {
            store.set_watermark(&view.name(), 0).await;
        }
        let counter = prometheus::IntCounter::new("notifications_dropped_total", "dropped").unwrap();
        let cancel = CancellationToken::new();

        let (closed, rx) = coalescing();
        drop(rx);
        let mut refresher = AggregateRefresher::new(store.clone(), DAY, Duration::from_secs(1))
            .with_caught_up(closed.with_counter(counter.clone()));
        assert!(refresher.converge(3 * DAY + 5, &cancel).await.unwrap());
        assert_eq!(counter.get(), 0);

        let (full, _rx) = coalescing();
        let full = full.with_counter(counter.clone());
        assert!(full.fire());
        let mut refresher = AggregateRefresher::new(store.clone(), DAY, Duration::from_secs(1))
            .with_caught_up(full);
        assert!(refresher.converge(6 * DAY + 5, &cancel).await.unwrap());
        assert_eq!(counter.get(), 1);
    }
}
