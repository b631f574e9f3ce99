use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{NETWORK_RETRY_BACKOFF_MS, RATE_LIMIT_RETRY_BACKOFF_MS};
use crate::controller::ScenarioController;
use crate::types::{ControlMsg, ServiceFailure};

/// Re-runs the selected analyses when the portfolio or settings change.
pub struct BatchTrigger {
    controller: Arc<ScenarioController>,
    control_rx: mpsc::Receiver<ControlMsg>,
}

impl BatchTrigger {
    pub fn new(
        controller: Arc<ScenarioController>,
        control_rx: mpsc::Receiver<ControlMsg>,
    ) -> Self {
        Self { controller, control_rx }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.control_rx.recv().await {
            // Collapse a burst of changes into one batch.
            let mut coalesced = 0usize;
            while self.control_rx.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!(?msg, coalesced, "Batch trigger woke");
            self.handle().await;
        }
    }

    /// Returns true if a batch was started.
    async fn handle(&self) -> bool {
        let store = self.controller.store();
        if !store.settings().auto_analyze {
            return false;
        }
        if store.current_portfolio_id().is_none() || store.selected_scenarios().is_empty() {
            debug!("Batch trigger: nothing selected, skipping");
            return false;
        }
        let report = self.controller.run_selected().await;
        if !report.errors.is_empty() {
            warn!(
                errors = report.errors.len(),
                "Batch run finished with errors: {}",
                report.errors.join("; "),
            );
        }
        true
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

/// Backoff before replaying a failed operation, or None if it is not retried.
/// Network failures (status 0) and rate limiting (429) are retried once.
pub fn retry_backoff(failure: &ServiceFailure) -> Option<Duration> {
    if failure.attempt > 0 {
        return None;
    }
    match failure.status {
        0 => Some(Duration::from_millis(NETWORK_RETRY_BACKOFF_MS)),
        429 => Some(Duration::from_millis(RATE_LIMIT_RETRY_BACKOFF_MS)),
        _ => None,
    }
}

/// Consumes backend failures; replays network and rate-limit failures once.
pub struct ErrorHandler {
    controller: Arc<ScenarioController>,
    failure_rx: mpsc::Receiver<ServiceFailure>,
}

impl ErrorHandler {
    pub fn new(
        controller: Arc<ScenarioController>,
        failure_rx: mpsc::Receiver<ServiceFailure>,
    ) -> Self {
        Self { controller, failure_rx }
    }

    pub async fn run(mut self) {
        while let Some(failure) = self.failure_rx.recv().await {
            let Some(backoff) = retry_backoff(&failure) else {
                info!(
                    op = %failure.op,
                    status = failure.status,
                    attempt = failure.attempt,
                    "Not retrying: {}",
                    failure.message,
                );
                continue;
            };

            warn!(
                op = %failure.op,
                status = failure.status,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying {} after {backoff:?}: {}",
                failure.op,
                failure.message,
            );

            // Sleep off the backoff in its own task so later failures are not held up.
            let controller = Arc::clone(&self.controller);
            tokio::spawn(async move {
                controller.health().inc_retries_pending();
                tokio::time::sleep(backoff).await;
                controller.health().dec_retries_pending();
                let op = failure.op;
                let label = op.to_string();
                if let Err(e) = controller.replay(op, failure.attempt + 1).await {
                    warn!("Retry of {label} failed: {e}");
                }
            });
        }
    }
}
