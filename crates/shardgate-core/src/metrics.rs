//! Global atomic counters for shardgate observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    tests_executed: AtomicU64,
    baseline_executions: AtomicU64,
    fallback_hits: AtomicU64,
    shards_unavailable: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tests_executed: AtomicU64::new(0),
            baseline_executions: AtomicU64::new(0),
            fallback_hits: AtomicU64::new(0),
            shards_unavailable: AtomicU64::new(0),
        }
    }

    pub fn inc_tests_executed(&self) {
        self.tests_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tests_executed", "counter incremented");
    }

    pub fn inc_baseline_executions(&self) {
        self.baseline_executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "baseline_executions", "counter incremented");
    }

    pub fn inc_fallback_hits(&self) {
        self.fallback_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fallback_hits", "counter incremented");
    }

    pub fn inc_shards_unavailable(&self) {
        self.shards_unavailable.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "shards_unavailable", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            tests_executed = self.tests_executed(),
            baseline_executions = self.baseline_executions(),
            fallback_hits = self.fallback_hits(),
            shards_unavailable = self.shards_unavailable(),
        );
    }

    pub fn tests_executed(&self) -> u64 {
        self.tests_executed.load(Ordering::Relaxed)
    }

    pub fn baseline_executions(&self) -> u64 {
        self.baseline_executions.load(Ordering::Relaxed)
    }

    pub fn fallback_hits(&self) -> u64 {
        self.fallback_hits.load(Ordering::Relaxed)
    }

    pub fn shards_unavailable(&self) -> u64 {
        self.shards_unavailable.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.tests_executed.store(0, Ordering::Relaxed);
        self.baseline_executions.store(0, Ordering::Relaxed);
        self.fallback_hits.store(0, Ordering::Relaxed);
        self.shards_unavailable.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_tests_executed();
        m.inc_tests_executed();
        assert_eq!(m.tests_executed(), 2);

        m.inc_baseline_executions();
        assert_eq!(m.baseline_executions(), 1);

        m.inc_fallback_hits();
        m.inc_shards_unavailable();
        assert_eq!(m.fallback_hits(), 1);
        assert_eq!(m.shards_unavailable(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_tests_executed();
        m.inc_baseline_executions();
        m.inc_fallback_hits();
        m.reset();
        assert_eq!(m.tests_executed(), 0);
        assert_eq!(m.baseline_executions(), 0);
        assert_eq!(m.fallback_hits(), 0);
    }
}
