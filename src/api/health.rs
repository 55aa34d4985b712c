//! Shared health state for the /health endpoint.
//! Updated by the refresher after every poll, read by the relay.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::local_cache::now_ms;
use crate::state::{AggregateStatus, RefreshOutcome};

/// Refresh counters. Updated by poll tasks, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// Millisecond timestamp of the last fresh upstream fetch (0 = none).
    pub last_fresh_at_ms: AtomicU64,
    /// Failed refreshes since the last fresh one. Cache fallbacks count as failures.
    pub consecutive_failures: AtomicU64,
    pub refreshes_total: AtomicU64,
    pub cache_fallbacks_total: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &RefreshOutcome) {
        match outcome {
            RefreshOutcome::Fresh => {
                self.refreshes_total.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.last_fresh_at_ms
                    .store(u64::try_from(now_ms()).unwrap_or_default(), Ordering::Relaxed);
            }
            RefreshOutcome::FromCache { .. } => {
                self.refreshes_total.fetch_add(1, Ordering::Relaxed);
                self.cache_fallbacks_total.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            RefreshOutcome::Failed(_) => {
                self.refreshes_total.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            RefreshOutcome::Coalesced | RefreshOutcome::NotTracked => {}
        }
    }

    pub fn last_fresh_at_ms(&self) -> u64 {
        self.last_fresh_at_ms.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn report(&self, status: Option<AggregateStatus>) -> HealthReport {
        let failures = self.consecutive_failures();
        let healthy = failures == 0 && status.as_ref().map_or(true, |s| s.error.is_none());
        let status = status.unwrap_or_default();
        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            last_fresh_at_ms: self.last_fresh_at_ms(),
            consecutive_failures: failures,
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            cache_fallbacks_total: self.cache_fallbacks_total.load(Ordering::Relaxed),
            is_loading: status.is_loading,
            is_refreshing: status.is_refreshing,
            last_update_ms: status.last_update_ms,
            error: status.error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub last_fresh_at_ms: u64,
    pub consecutive_failures: u64,
    pub refreshes_total: u64,
    pub cache_fallbacks_total: u64,
    pub is_loading: bool,
    pub is_refreshing: bool,
    pub last_update_ms: Option<i64>,
    pub error: Option<String>,
}
