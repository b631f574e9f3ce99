use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::CACHE_SWEEP_INTERVAL_SECS;
use crate::controller::{LoadOutcome, ScenarioController};

/// Keeps the scenario catalog fresh for the lifetime of the process.
///
/// Each pass reloads the catalog if it is stale and auto-refresh is on, then
/// sleeps for the current cache timeout. The timeout is re-read every pass,
/// so a settings change takes effect after the current sleep.
pub struct CatalogRefresher {
    controller: Arc<ScenarioController>,
}

impl CatalogRefresher {
    pub fn new(controller: Arc<ScenarioController>) -> Self {
        Self { controller }
    }

    pub async fn run(self) {
        loop {
            self.tick().await;
            let pause = self.controller.store().settings().cache_timeout;
            // A zero timeout would turn this into a busy loop.
            tokio::time::sleep(pause.max(Duration::from_secs(1))).await;
        }
    }

    /// Returns true if a reload was attempted.
    async fn tick(&self) -> bool {
        let store = self.controller.store();
        if !store.settings().auto_refresh {
            debug!("Auto-refresh disabled, skipping catalog check");
            return false;
        }
        if !store.should_refresh_scenarios() {
            return false;
        }

        match self.controller.load_scenarios().await {
            Ok(LoadOutcome::Loaded(n)) => info!(scenarios = n, "Catalog auto-refresh complete"),
            Ok(LoadOutcome::AlreadyInFlight) => {
                debug!("Catalog auto-refresh skipped: load in flight")
            }
            Err(e) => error!("Catalog auto-refresh failed: {e}"),
        }
        true
    }
}

// ---------------------------------------------------------------------------
// CacheSweeper
// ---------------------------------------------------------------------------

/// Evicts individual expired simulation and impact results every 10 minutes.
pub struct CacheSweeper {
    controller: Arc<ScenarioController>,
}

impl CacheSweeper {
    pub fn new(controller: Arc<ScenarioController>) -> Self {
        Self { controller }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(CACHE_SWEEP_INTERVAL_SECS));
        ticker.tick().await; // caches start empty; skip the immediate first tick

        loop {
            ticker.tick().await;
            self.sweep(Instant::now());
        }
    }

    /// Returns `(simulations_removed, impacts_removed)`.
    fn sweep(&self, now: Instant) -> (usize, usize) {
        let store = self.controller.store();
        if store.simulations.is_empty() && store.impacts.is_empty() {
            debug!("Cache sweep: caches empty");
            return (0, 0);
        }
        let (sims, impacts) = store.evict_expired(now);
        if sims + impacts > 0 {
            info!(
                simulations_evicted = sims,
                impacts_evicted = impacts,
                simulations_remaining = store.simulations.len(),
                impacts_remaining = store.impacts.len(),
                "Cache sweep: evicted {sims} simulations, {impacts} impact results",
            );
        } else {
            debug!("Cache sweep: nothing expired");
        }
        (sims, impacts)
    }
}
