//! Sync scheduling - manual, on-demand and periodic drains.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use showsync_common::{Error, Result};

/// When the scheduler drains the queue on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Drain only when asked.
    #[default]
    Manual,
    /// Drain whenever a mutation is queued.
    OnDemand,
    /// Drain on a timer.
    Periodic { interval_secs: u64 },
    /// Both on-demand and periodic.
    Hybrid { interval_secs: u64 },
}

impl SyncMode {
    /// Timer period, if the mode has one.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_secs } | SyncMode::Hybrid { interval_secs } => {
                Some(Duration::from_secs((*interval_secs).max(1)))
            }
            _ => None,
        }
    }

    fn drains_on_change(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// What caused a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTrigger {
    /// User asked to retry now.
    Manual,
    ConnectivityRegained,
    Timer,
    /// A mutation was queued.
    Change,
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    Drain(SyncTrigger),
    /// Shutdown the scheduler.
    Shutdown,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    /// Mutations written as-is.
    pub succeeded: usize,
    /// Mutations settled through conflict resolution.
    pub merged: usize,
    /// Retryable failures left for the next cycle.
    pub failed: usize,
    pub dead_lettered: usize,
    pub unresolved: usize,
    pub duration: Duration,
    /// Set when the cycle did not run (offline, or another drain active).
    pub skipped: bool,
}

impl SyncReport {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            succeeded: 0,
            merged: 0,
            failed: 0,
            dead_lettered: 0,
            unresolved: 0,
            duration: Duration::ZERO,
            skipped: false,
        }
    }

    pub fn skipped(trigger: SyncTrigger) -> Self {
        Self {
            skipped: true,
            ..Self::new(trigger)
        }
    }

    /// Mutations that left the pending set this cycle.
    pub fn processed(&self) -> usize {
        self.succeeded + self.merged + self.dead_lettered + self.unresolved
    }
}

type Reply = oneshot::Sender<Result<SyncReport>>;

/// Front end for requesting drains from the background task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Option<Reply>)>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a drain and wait for its report.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Drain(trigger), Some(response_tx)))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Ask for a drain without waiting. Dropped if the request queue is full,
    /// since a drain is already pending then.
    pub fn trigger(&self, trigger: SyncTrigger) {
        if self
            .request_tx
            .try_send((SyncRequest::Drain(trigger), None))
            .is_err()
        {
            debug!("Drain request ({:?}) dropped, scheduler busy or stopped", trigger);
        }
    }

    /// Notify the scheduler that a mutation was queued.
    pub async fn notify_change(&self) {
        let mode = *self.mode.read().await;
        if mode.drains_on_change() {
            self.trigger(SyncTrigger::Change);
        } else {
            debug!("Change notification ignored (mode: {:?})", mode);
        }
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        *self.mode.read().await
    }

    /// Stop the background loop.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Option<Reply>)>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown or until every sender is gone.
    ///
    /// This should be spawned in a tokio task. `sync_fn` is called whenever
    /// a drain is needed.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncReport>> + Send,
    {
        let mut current_interval = self.mode.read().await.interval();
        let mut ticker = current_interval.map(make_interval);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Drain(trigger), reply)) => {
                            debug!("Processing drain request: {:?}", trigger);
                            let result = sync_fn(trigger).await;
                            match reply {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => log_result(trigger, &result),
                            }
                        }
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = wait_for_tick(&mut ticker) => {
                    let result = sync_fn(SyncTrigger::Timer).await;
                    log_result(SyncTrigger::Timer, &result);
                }
            }

            // Pick up mode changes
            let expected = self.mode.read().await.interval();
            if expected != current_interval {
                debug!("Sync interval changed to {:?}", expected);
                current_interval = expected;
                ticker = expected.map(make_interval);
            }
        }
    }
}

fn make_interval(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_result(trigger: SyncTrigger, result: &Result<SyncReport>) {
    match result {
        Ok(report) if report.skipped => debug!("{:?} drain skipped", trigger),
        Ok(report) => info!(
            "{:?} drain completed: {} succeeded, {} merged, {} failed, {} dead-lettered, {} unresolved",
            trigger,
            report.succeeded,
            report.merged,
            report.failed,
            report.dead_lettered,
            report.unresolved
        ),
        Err(e) => error!("{:?} drain failed: {}", trigger, e),
    }
}
