//! Interval trigger with at-most-one active run.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use super::{Pipeline, RunOptions, RunReport};

/// Default interval between scheduled runs (one week).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fires pipeline runs, skipping triggers while a run is in flight.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    options: RunOptions,
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when the run task ends, including by panic.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>, options: RunOptions) -> Self {
        Self {
            pipeline,
            options,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a run is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Starts a run unless one is active.
    ///
    /// Returns `None` when the trigger was skipped.
    pub fn trigger(&self) -> Option<JoinHandle<RunReport>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous run still active; trigger skipped");
            return None;
        }

        let guard = BusyGuard(Arc::clone(&self.busy));
        let pipeline = Arc::clone(&self.pipeline);
        let options = self.options;
        Some(tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(options).await
        }))
    }

    /// Triggers a run every `period`, starting immediately, until `shutdown`
    /// resolves. Missed ticks are skipped rather than bunched.
    ///
    /// Returns the number of runs started. A run still in flight at shutdown
    /// is awaited.
    #[instrument(skip(self, shutdown), fields(period_secs = period.as_secs()))]
    pub async fn run_until<F>(&self, period: Duration, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut started: u64 = 0;
        let mut in_flight: Option<JoinHandle<RunReport>> = None;
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested; scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(handle) = self.trigger() {
                        started += 1;
                        in_flight = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = in_flight
            && !handle.is_finished()
        {
            info!("waiting for active run to finish");
            if let Err(error) = handle.await {
                warn!(error = %error, "active run ended abnormally");
            }
        }
        started
    }
}
