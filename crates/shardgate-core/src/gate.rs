//! Regression gate over the combined report.

use serde::{Deserialize, Serialize};

use crate::domain::CombinedReport;
use crate::obs::emit_gate_evaluated;

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    /// Process exit status for the pipeline: 0 iff the gate passed.
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

/// Evaluate the gate. Shards are numbered from 1 in violations.
///
/// Gate rule:
/// - every expected shard must have reported; an unavailable or missing
///   shard is a violation even when no failures were observed elsewhere
/// - every new failure is a violation
/// - pre-existing failures never fail the gate
pub fn evaluate_gate(report: &CombinedReport) -> GateVerdict {
    let mut violations = Vec::new();

    for (index, reason) in report.unavailable() {
        violations.push(format!("shard {} unavailable: {reason}", index + 1));
    }
    for index in report.missing() {
        violations.push(format!("shard {} did not report", index + 1));
    }
    for failure in &report.new_failures {
        let baseline = failure
            .failure
            .baseline
            .map_or_else(|| "no baseline record".to_string(), |b| format!("baseline {b}"));
        violations.push(format!(
            "new failure in shard {}: {} ({}, {})",
            failure.shard_index + 1,
            failure.failure.test,
            failure.failure.outcome,
            baseline
        ));
    }

    let passed = violations.is_empty();
    let message = if passed {
        format!("No new failures ({})", report.coverage_line())
    } else if report.is_complete() {
        format!("Gate failed: {} new failure(s)", report.new_failures.len())
    } else {
        format!(
            "Gate failed: {} new failure(s); incomplete, {}",
            report.new_failures.len(),
            report.coverage_line()
        )
    };

    emit_gate_evaluated(
        report.reported_count(),
        report.expected_shards,
        report.new_failures.len(),
        passed,
    );

    GateVerdict {
        passed,
        violations,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregator, UnavailableShard};
    use crate::domain::{
        Backend, NewFailure, NewFailureReport, Outcome, ShardResult, TestId, TestRecord,
    };

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    fn clean_shard(index: usize, count: usize) -> (ShardResult, NewFailureReport) {
        let mut r = ShardResult::new(index, count, Backend::Torch);
        r.push(TestRecord::new(tid(&format!("t{index}")), Outcome::Pass));
        (r, NewFailureReport::empty(index))
    }

    #[test]
    fn all_clean_passes() {
        let (r0, n0) = clean_shard(0, 2);
        let (r1, n1) = clean_shard(1, 2);
        let report = Aggregator::new(2)
            .unwrap()
            .aggregate(&[r0, r1], &[n0, n1], &[])
            .unwrap();
        let verdict = evaluate_gate(&report);
        assert!(verdict.passed);
        assert_eq!(verdict.exit_code(), 0);
        assert!(verdict.message.contains("2 of 2 shards reported"));
    }

    #[test]
    fn pre_existing_failures_do_not_gate() {
        let mut r = ShardResult::new(0, 1, Backend::Torch);
        r.push(TestRecord::new(tid("flaky"), Outcome::Fail));
        let n = NewFailureReport {
            shard_index: 0,
            new_failures: vec![],
            pre_existing: vec![tid("flaky")],
        };
        let report = Aggregator::new(1).unwrap().aggregate(&[r], &[n], &[]).unwrap();
        assert!(evaluate_gate(&report).passed);
    }

    #[test]
    fn new_failure_fails() {
        let mut r = ShardResult::new(0, 1, Backend::Torch);
        r.push(TestRecord::new(tid("B"), Outcome::Fail));
        let n = NewFailureReport {
            shard_index: 0,
            new_failures: vec![NewFailure {
                test: tid("B"),
                outcome: Outcome::Fail,
                baseline: None,
                diagnostic: None,
            }],
            pre_existing: vec![],
        };
        let report = Aggregator::new(1).unwrap().aggregate(&[r], &[n], &[]).unwrap();
        let verdict = evaluate_gate(&report);
        assert!(!verdict.passed);
        assert_eq!(verdict.exit_code(), 1);
        assert!(verdict.violations[0].contains("no baseline record"));
    }

    #[test]
    fn incomplete_run_fails_closed_without_failures() {
        let shards: Vec<_> = [0, 2, 3].iter().map(|&i| clean_shard(i, 4)).collect();
        let (results, reports): (Vec<_>, Vec<_>) = shards.into_iter().unzip();
        let report = Aggregator::new(4)
            .unwrap()
            .aggregate(&results, &reports, &[UnavailableShard::new(1, "runner crashed")])
            .unwrap();

        assert_eq!(report.coverage_line(), "3 of 4 shards reported");
        let verdict = evaluate_gate(&report);
        assert!(!verdict.passed);
        assert!(verdict.message.contains("3 of 4 shards reported"));
        assert!(verdict.violations[0].contains("shard 2 unavailable: runner crashed"));
    }
}
