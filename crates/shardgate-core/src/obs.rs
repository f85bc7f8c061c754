//! Structured observability hooks for the selection/execution lifecycle.
//!
//! - [`RunSpan`] enters a run-scoped span for the duration of a pipeline run
//! - `emit_*` functions log key lifecycle events with stable `event` names

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span.
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // every event below carries run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("shardgate.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: the mapping was (re)indexed.
pub fn emit_mapping_indexed(files: usize, commits_indexed: usize, degraded: bool) {
    info!(
        event = "mapping.indexed",
        files = files,
        commits_indexed = commits_indexed,
        degraded = degraded,
    );
}

/// Emit event: a selection was resolved for a change set.
pub fn emit_selection_resolved(changed: usize, selected: usize, shards: usize, fallback: usize) {
    info!(
        event = "selection.resolved",
        changed_paths = changed,
        selected_tests = selected,
        shards = shards,
        fallback_paths = fallback,
    );
}

/// Emit event: a shard started executing.
pub fn emit_shard_started(shard_index: usize, tests: usize, backend: &str) {
    info!(event = "shard.started", shard = shard_index, tests = tests, backend = %backend);
}

/// Emit event: a shard finished with its tallies.
pub fn emit_shard_finished(shard_index: usize, passed: usize, failures: usize, duration_ms: u64) {
    info!(
        event = "shard.finished",
        shard = shard_index,
        passed = passed,
        failures = failures,
        duration_ms = duration_ms,
    );
}

/// Emit event: a shard could not produce results (warning level).
pub fn emit_shard_unavailable(shard_index: usize, reason: &dyn std::fmt::Display) {
    warn!(event = "shard.unavailable", shard = shard_index, reason = %reason);
}

/// Emit event: a shard's failures were classified against the baseline.
pub fn emit_baseline_classified(shard_index: usize, new_failures: usize, pre_existing: usize) {
    info!(
        event = "baseline.classified",
        shard = shard_index,
        new_failures = new_failures,
        pre_existing = pre_existing,
    );
}

/// Emit event: the gate was evaluated.
pub fn emit_gate_evaluated(reported: usize, expected: usize, new_failures: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        reported_shards = reported,
        expected_shards = expected,
        new_failures = new_failures,
        passed = passed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_selection_resolved(3, 10, 2, 1);
        emit_shard_unavailable(1, &"timed out");
    }
}
