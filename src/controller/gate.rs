use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::config::GateMode;
use crate::error::{AppError, Result};

/// Soft cap on simultaneous analyses (simulations + impact runs).
///
/// Shared by `Arc`; each admitted request holds an `AnalysisPermit` and the
/// slot is released when the permit drops, whichever way the request ends.
pub struct AnalysisGate {
    active: AtomicUsize,
    max: AtomicUsize,
    mode: GateMode,
    released: Notify,
}

impl AnalysisGate {
    pub fn new(max: usize, mode: GateMode) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max: AtomicUsize::new(max.max(1)),
            mode,
            released: Notify::new(),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Takes effect for the next admission; running analyses are not touched.
    pub fn set_max(&self, max: usize) {
        self.max.store(max.max(1), Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Claim a slot if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AnalysisPermit> {
        let max = self.max();
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| AnalysisPermit { gate: Arc::clone(self) })
    }

    /// Claim a slot according to the configured mode.
    pub async fn acquire(self: &Arc<Self>) -> Result<AnalysisPermit> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }
        match self.mode {
            GateMode::Reject => Err(AppError::CapacityReached(self.max())),
            GateMode::Requeue { delay, max_attempts } => {
                for attempt in 1..=max_attempts {
                    debug!(
                        attempt,
                        active = self.active(),
                        "Analysis gate full, requeueing in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(permit) = self.try_acquire() {
                        return Ok(permit);
                    }
                }
                Err(AppError::CapacityReached(self.max()))
            }
        }
    }

    /// Wait for a free slot however long it takes, whatever the mode.
    /// Batch runs admit through here.
    pub async fn acquire_queued(self: &Arc<Self>) -> AnalysisPermit {
        loop {
            // Register before checking so a release in between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            released.await;
        }
    }
}

pub struct AnalysisPermit {
    gate: Arc<AnalysisGate>,
}

impl Drop for AnalysisPermit {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
        self.gate.released.notify_waiters();
    }
}
