// Background status polling: once per collection load, or on a fixed interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::InstanceApi;
use crate::metrics;
use crate::models::{ChallengeId, ChallengeSummary};
use crate::store::{FetchOutcome, InstanceStore};

/// How a collection batch is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    /// One fetch at a time, in order.
    #[default]
    Sequential,
    /// Up to `max_concurrency` fetches at once.
    Parallel { max_concurrency: usize },
}

/// How a surface keeps its instances fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// Fetch every challenge once, then stop.
    BatchOnce(BatchMode),
    /// Fetch immediately, then every period until stopped.
    Interval(Duration),
}

/// Alive flag shared between a poller task and its owner.
#[derive(Debug, Clone)]
pub struct Mounted(Arc<AtomicBool>);

impl Mounted {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn unmount(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Mounted {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner side of a background poller. Dropping it stops the poller: the task
/// is aborted and responses still in flight are never applied.
#[derive(Debug)]
pub struct PollHandle<T> {
    task: Option<JoinHandle<T>>,
    mounted: Mounted,
    counts_as_poller: bool,
}

impl<T> PollHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop polling now.
    pub fn stop(self) {
        drop(self);
    }

    /// Wait for the poller to finish on its own. `None` if it was aborted.
    pub async fn join(mut self) -> Option<T> {
        let task = self.task.take()?;
        task.await.ok()
    }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) {
        self.mounted.unmount();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.counts_as_poller {
            metrics::ACTIVE_POLLERS.dec();
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub requested: usize,
    pub fetched: usize,
    pub failed: Vec<ChallengeId>,
    pub skipped: usize,
}

/// Fetch the status of every id once. A failure for one challenge is logged
/// and does not stop the others.
pub async fn fetch_batch<F>(
    api: &dyn InstanceApi,
    store: &InstanceStore,
    ids: &[ChallengeId],
    mode: BatchMode,
    is_live: F,
) -> BatchReport
where
    F: Fn() -> bool,
{
    let mut report = BatchReport {
        requested: ids.len(),
        ..Default::default()
    };

    let outcomes: Vec<(ChallengeId, FetchOutcome)> = match mode {
        BatchMode::Sequential => {
            let mut outcomes = Vec::with_capacity(ids.len());
            for &id in ids {
                if !is_live() {
                    break;
                }
                outcomes.push((id, store.refresh_while(api, id, &is_live).await));
            }
            outcomes
        }
        BatchMode::Parallel { max_concurrency } => {
            stream::iter(ids.iter().copied())
                .map(|id| {
                    let is_live = &is_live;
                    async move { (id, store.refresh_while(api, id, is_live).await) }
                })
                .buffer_unordered(max_concurrency.max(1))
                .collect()
                .await
        }
    };

    for (id, outcome) in &outcomes {
        match outcome {
            FetchOutcome::Applied(_) | FetchOutcome::Stale => report.fetched += 1,
            FetchOutcome::Failed(e) => {
                warn!(challenge_id = %id, "batch status fetch failed, continuing: {e}");
                report.failed.push(*id);
            }
            FetchOutcome::Cancelled => report.skipped += 1,
        }
    }
    report.skipped += ids.len() - outcomes.len();
    report.failed.sort();

    debug!(
        requested = report.requested,
        fetched = report.fetched,
        failed = report.failed.len(),
        "status batch finished"
    );
    report
}

/// Spawn a poller for `ids` under the given policy.
pub fn spawn_policy(
    policy: PollPolicy,
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    ids: Vec<ChallengeId>,
) -> PollHandle<BatchReport> {
    match policy {
        PollPolicy::BatchOnce(mode) => spawn_batch(api, store, ids, mode),
        PollPolicy::Interval(period) => spawn_interval(api, store, ids, period),
    }
}

/// Run one batch in the background.
pub fn spawn_batch(
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    ids: Vec<ChallengeId>,
    mode: BatchMode,
) -> PollHandle<BatchReport> {
    let mounted = Mounted::new();
    let live = mounted.clone();
    let task = tokio::spawn(async move {
        fetch_batch(api.as_ref(), &store, &ids, mode, move || live.is_live()).await
    });
    PollHandle {
        task: Some(task),
        mounted,
        counts_as_poller: false,
    }
}

/// Fetch immediately, then every `period`, until the handle is dropped.
/// The task never finishes on its own; its report is that of the last tick.
pub fn spawn_interval(
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    ids: Vec<ChallengeId>,
    period: Duration,
) -> PollHandle<BatchReport> {
    let mounted = Mounted::new();
    let live = mounted.clone();
    metrics::ACTIVE_POLLERS.inc();
    info!(challenges = ids.len(), period_secs = period.as_secs_f64(), "starting interval poller");

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = BatchReport::default();
        loop {
            // The first tick completes immediately.
            ticker.tick().await;
            if !live.is_live() {
                return last;
            }
            // Failures are retried on the next tick.
            let still = live.clone();
            last = fetch_batch(
                api.as_ref(),
                &store,
                &ids,
                BatchMode::Sequential,
                move || still.is_live(),
            )
            .await;
        }
    });

    PollHandle {
        task: Some(task),
        mounted,
        counts_as_poller: true,
    }
}

/// Batch-once policy for a rendered collection of challenges.
///
/// `on_render` may be called any number of times; a batch runs only the first
/// time the collection contains docker challenges. [`reset`](Self::reset)
/// starts a new collection load.
pub struct CollectionPoller {
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    mode: BatchMode,
    fetched: AtomicBool,
    current: Mutex<Option<PollHandle<BatchReport>>>,
}

impl CollectionPoller {
    pub fn new(api: Arc<dyn InstanceApi>, store: InstanceStore) -> Self {
        Self {
            api,
            store,
            mode: BatchMode::Sequential,
            fetched: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this collection load already ran its batch.
    pub fn has_fetched(&self) -> bool {
        self.fetched.load(Ordering::Acquire)
    }

    /// Called whenever the collection is presented. Returns true when this
    /// call started the batch.
    pub fn on_render(&self, challenges: &[ChallengeSummary]) -> bool {
        let ids: Vec<ChallengeId> = challenges
            .iter()
            .filter(|c| c.is_docker())
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return false;
        }
        // Set before the batch starts so renders during the batch are no-ops.
        if self.fetched.swap(true, Ordering::AcqRel) {
            return false;
        }

        info!(challenges = ids.len(), "fetching instance status for collection");
        let handle = spawn_batch(self.api.clone(), self.store.clone(), ids, self.mode);
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// Wait for the running batch, if any.
    pub async fn wait(&self) -> Option<BatchReport> {
        let handle = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        handle.join().await
    }

    /// Forget the previous load. A batch still running is cancelled.
    pub fn reset(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(previous);
        self.fetched.store(false, Ordering::Release);
    }
}
