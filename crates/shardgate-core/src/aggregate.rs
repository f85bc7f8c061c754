//! Aggregator: merges per-shard results and new-failure reports.
//!
//! Inputs are keyed by shard index before merging, so the combined report
//! does not depend on the order in which shards arrived. Shards that did not
//! report stay visible as `unavailable` or `missing`.

use std::collections::BTreeMap;

use tracing::warn;

use crate::domain::{
    CombinedReport, NewFailureReport, OutcomeCounts, Result, ShardFailure, ShardResult,
    ShardStatus, ShardSummary, ShardgateError,
};
use crate::metrics::METRICS;
use crate::obs::emit_shard_unavailable;

/// A shard whose execution environment failed outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableShard {
    pub shard_index: usize,
    pub reason: String,
}

impl UnavailableShard {
    pub fn new(shard_index: usize, reason: impl Into<String>) -> Self {
        Self {
            shard_index,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    expected_shards: usize,
}

impl Aggregator {
    pub fn new(expected_shards: usize) -> Result<Self> {
        if expected_shards == 0 {
            return Err(ShardgateError::InvalidShardCount(expected_shards));
        }
        Ok(Self { expected_shards })
    }

    /// Merge everything received for the run.
    ///
    /// A shard marked unavailable stays unavailable even if partial results
    /// for it arrived. Results without a matching report (or the reverse)
    /// make the shard unavailable. Two inputs of the same kind for one shard
    /// are rejected.
    pub fn aggregate(
        &self,
        results: &[ShardResult],
        reports: &[NewFailureReport],
        unavailable: &[UnavailableShard],
    ) -> Result<CombinedReport> {
        let results = self.index_by_shard(results.iter().map(|r| (r.shard_index, r)))?;
        let reports = self.index_by_shard(reports.iter().map(|r| (r.shard_index, r)))?;
        let unavailable =
            self.index_by_shard(unavailable.iter().map(|u| (u.shard_index, u.reason.as_str())))?;

        let mut shards = Vec::with_capacity(self.expected_shards);
        let mut totals = OutcomeCounts::default();
        let mut new_failures = Vec::new();
        let mut pre_existing = Vec::new();

        for index in 0..self.expected_shards {
            let result = results.get(&index).copied();
            let report = reports.get(&index).copied();

            let status = match (unavailable.get(&index), result, report) {
                (Some(reason), _, _) => ShardStatus::Unavailable {
                    reason: reason.to_string(),
                },
                (None, Some(result), Some(_)) if result.shard_count != self.expected_shards => {
                    ShardStatus::Unavailable {
                        reason: format!(
                            "results were produced for {} shard(s), expected {}",
                            result.shard_count, self.expected_shards
                        ),
                    }
                }
                (None, Some(_), Some(_)) => ShardStatus::Reported,
                (None, Some(_), None) => ShardStatus::Unavailable {
                    reason: "new-failure report missing".to_string(),
                },
                (None, None, Some(_)) => ShardStatus::Unavailable {
                    reason: "shard results missing".to_string(),
                },
                (None, None, None) => ShardStatus::Missing,
            };

            let summary = match (status.is_reported(), result, report) {
                (true, Some(result), Some(report)) => {
                    let counts = result.counts();
                    totals.merge(&counts);
                    new_failures.extend(report.new_failures.iter().map(|f| ShardFailure {
                        shard_index: index,
                        failure: f.clone(),
                    }));
                    pre_existing.extend(report.pre_existing.iter().map(|t| (index, t.clone())));
                    ShardSummary {
                        shard_index: index,
                        status,
                        backend: Some(result.backend),
                        counts,
                        new_failures: report.new_failures.len(),
                        pre_existing: report.pre_existing.len(),
                    }
                }
                _ => {
                    match &status {
                        ShardStatus::Unavailable { reason } => {
                            emit_shard_unavailable(index, reason);
                        }
                        _ => warn!(shard = index, "no artifacts received for shard"),
                    }
                    METRICS.inc_shards_unavailable();
                    ShardSummary {
                        shard_index: index,
                        status,
                        backend: result.map(|r| r.backend),
                        counts: OutcomeCounts::default(),
                        new_failures: 0,
                        pre_existing: 0,
                    }
                }
            };
            shards.push(summary);
        }

        new_failures.sort();
        pre_existing.sort();

        Ok(CombinedReport {
            expected_shards: self.expected_shards,
            shards,
            totals,
            new_failures,
            pre_existing,
        })
    }

    fn index_by_shard<T>(
        &self,
        items: impl Iterator<Item = (usize, T)>,
    ) -> Result<BTreeMap<usize, T>> {
        let mut indexed = BTreeMap::new();
        for (index, item) in items {
            if index >= self.expected_shards {
                return Err(ShardgateError::ShardOutOfRange {
                    index,
                    expected: self.expected_shards,
                });
            }
            if indexed.insert(index, item).is_some() {
                return Err(ShardgateError::DuplicateShard(index));
            }
        }
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Backend, NewFailure, Outcome, TestId, TestRecord};

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    fn result(index: usize, count: usize, records: &[(&str, Outcome)]) -> ShardResult {
        let mut r = ShardResult::new(index, count, Backend::Jax);
        for (name, outcome) in records {
            r.push(TestRecord::new(tid(name), *outcome));
        }
        r
    }

    fn report(index: usize, new: &[&str], pre: &[&str]) -> NewFailureReport {
        NewFailureReport {
            shard_index: index,
            new_failures: new
                .iter()
                .map(|n| NewFailure {
                    test: tid(n),
                    outcome: Outcome::Fail,
                    baseline: Some(Outcome::Pass),
                    diagnostic: None,
                })
                .collect(),
            pre_existing: pre.iter().map(|p| tid(p)).collect(),
        }
    }

    #[test]
    fn merges_counts_and_failures() {
        let results = vec![
            result(0, 2, &[("a", Outcome::Pass), ("b", Outcome::Fail)]),
            result(1, 2, &[("c", Outcome::Fail), ("d", Outcome::Skipped)]),
        ];
        let reports = vec![report(0, &["b"], &[]), report(1, &[], &["c"])];
        let combined = Aggregator::new(2)
            .unwrap()
            .aggregate(&results, &reports, &[])
            .unwrap();

        assert!(combined.is_complete());
        assert_eq!(combined.totals.total(), 4);
        assert_eq!(combined.totals.failed, 2);
        assert_eq!(combined.new_failure_ids(), vec![tid("b")]);
        assert_eq!(combined.pre_existing, vec![(1, tid("c"))]);
    }

    #[test]
    fn unavailable_marker_wins_over_partial_results() {
        let results = vec![result(0, 1, &[("a", Outcome::Pass)])];
        let reports = vec![report(0, &[], &[])];
        let combined = Aggregator::new(1)
            .unwrap()
            .aggregate(&results, &reports, &[UnavailableShard::new(0, "killed")])
            .unwrap();
        assert!(!combined.is_complete());
        assert_eq!(combined.unavailable().collect::<Vec<_>>(), vec![(0, "killed")]);
        assert_eq!(combined.totals.total(), 0);
    }

    #[test]
    fn results_without_report_are_unavailable() {
        let results = vec![result(0, 1, &[("a", Outcome::Fail)])];
        let combined = Aggregator::new(1)
            .unwrap()
            .aggregate(&results, &[], &[])
            .unwrap();
        let reasons: Vec<_> = combined.unavailable().collect();
        assert_eq!(reasons, vec![(0, "new-failure report missing")]);
    }

    #[test]
    fn mismatched_shard_count_is_unavailable() {
        let results = vec![result(0, 3, &[])];
        let reports = vec![report(0, &[], &[])];
        let combined = Aggregator::new(2)
            .unwrap()
            .aggregate(&results, &reports, &[])
            .unwrap();
        assert_eq!(combined.unavailable().count(), 1);
        assert_eq!(combined.missing().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn duplicate_and_out_of_range_rejected() {
        let agg = Aggregator::new(2).unwrap();
        let dup = vec![result(0, 2, &[]), result(0, 2, &[])];
        assert!(matches!(
            agg.aggregate(&dup, &[], &[]),
            Err(ShardgateError::DuplicateShard(0))
        ));
        let oob = vec![result(5, 2, &[])];
        assert!(matches!(
            agg.aggregate(&oob, &[], &[]),
            Err(ShardgateError::ShardOutOfRange { index: 5, .. })
        ));
        assert!(Aggregator::new(0).is_err());
    }
}
