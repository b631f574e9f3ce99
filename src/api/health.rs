//! Shared health state for the /health endpoint.
//! Updated by the controller, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// False until the backend answers once, and again after a network failure.
    pub backend_reachable: AtomicBool,
    /// Epoch milliseconds of the last successful catalog load (0 = never).
    pub last_catalog_at_ms: AtomicU64,
    /// Backend failures since start.
    pub failures_total: AtomicU64,
    /// Operations sleeping in the error handler before a replay.
    pub retries_pending: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_backend_reachable(&self, v: bool) {
        self.backend_reachable.store(v, Ordering::Relaxed);
    }

    pub fn set_last_catalog_at_ms(&self, ms: u64) {
        self.last_catalog_at_ms.store(ms, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries_pending(&self) {
        self.retries_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_retries_pending(&self) {
        self.retries_pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn backend_reachable(&self) -> bool {
        self.backend_reachable.load(Ordering::Relaxed)
    }

    pub fn last_catalog_at_ms(&self) -> u64 {
        self.last_catalog_at_ms.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    pub fn retries_pending(&self) -> u64 {
        self.retries_pending.load(Ordering::Relaxed)
    }
}
