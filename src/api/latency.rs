//! Round-trip times of upstream calls, kept in an HDR histogram.
//!
//! Both the retrying fetch client and the relay feed the same instance, so
//! `/stats/latency` covers polling and browser traffic alike.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Microsecond histogram behind a mutex. A poisoned lock drops the sample.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

/// Percentile summary served at `/stats/latency`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl LatencyStats {
    /// Range 1us..=100s at 3 significant figures. Slower calls saturate at the top bucket.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let Ok(mut histogram) = self.inner.lock() else { return };
        // Sub-microsecond calls land in the lowest bucket.
        histogram.saturating_record(us.max(1));
    }

    /// Median, p95 and p99 in microseconds.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Percentiles converted to milliseconds for the JSON endpoint.
    pub fn summary(&self) -> LatencySummary {
        let to_ms = |us: Option<u64>| us.map(|v| v as f64 / 1_000.0);
        let (p50, p95, p99) = self.percentiles();
        LatencySummary {
            samples: self.len(),
            p50_ms: to_ms(p50),
            p95_ms: to_ms(p95),
            p99_ms: to_ms(p99),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
