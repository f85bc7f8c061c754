//! New-failure classification results and the combined run report.

use serde::{Deserialize, Serialize};

use super::test_id::{Backend, Outcome, OutcomeCounts, TestId};

/// How a failing test relates to the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Failing in the PR but passing, skipped or unknown on the baseline.
    New,
    /// Also failing on the baseline.
    PreExisting,
}

/// A failing test that gates the pull request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewFailure {
    pub test: TestId,
    pub outcome: Outcome,
    /// Baseline outcome, `None` when the baseline had no record.
    pub baseline: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Classification of one shard's failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFailureReport {
    pub shard_index: usize,
    pub new_failures: Vec<NewFailure>,
    /// Failing tests excluded because they also fail on the baseline.
    pub pre_existing: Vec<TestId>,
}

impl NewFailureReport {
    pub fn empty(shard_index: usize) -> Self {
        Self {
            shard_index,
            new_failures: Vec::new(),
            pre_existing: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.new_failures.is_empty()
    }

    pub fn new_failure_ids(&self) -> Vec<TestId> {
        self.new_failures.iter().map(|f| f.test.clone()).collect()
    }
}

/// Whether a shard's artifacts made it to aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShardStatus {
    Reported,
    /// The shard ran but its execution environment failed, or its artifacts
    /// were truncated.
    Unavailable { reason: String },
    /// Nothing was received for the shard.
    Missing,
}

impl ShardStatus {
    pub fn is_reported(&self) -> bool {
        matches!(self, ShardStatus::Reported)
    }
}

/// Per-shard line in the combined report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub shard_index: usize,
    #[serde(flatten)]
    pub status: ShardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    pub counts: OutcomeCounts,
    pub new_failures: usize,
    pub pre_existing: usize,
}

/// A new failure tagged with the shard it came from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard_index: usize,
    #[serde(flatten)]
    pub failure: NewFailure,
}

/// Union of all shard results and new-failure reports for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub expected_shards: usize,
    /// One entry per expected shard, ordered by index.
    pub shards: Vec<ShardSummary>,
    pub totals: OutcomeCounts,
    /// Ordered by shard index, then test id.
    pub new_failures: Vec<ShardFailure>,
    /// Ordered by shard index, then test id.
    pub pre_existing: Vec<(usize, TestId)>,
}

impl CombinedReport {
    pub fn reported_count(&self) -> usize {
        self.shards.iter().filter(|s| s.status.is_reported()).count()
    }

    /// Every expected shard reported.
    pub fn is_complete(&self) -> bool {
        self.reported_count() == self.expected_shards
    }

    pub fn unavailable(&self) -> impl Iterator<Item = (usize, &str)> {
        self.shards.iter().filter_map(|s| match &s.status {
            ShardStatus::Unavailable { reason } => Some((s.shard_index, reason.as_str())),
            _ => None,
        })
    }

    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        self.shards
            .iter()
            .filter(|s| s.status == ShardStatus::Missing)
            .map(|s| s.shard_index)
    }

    pub fn new_failure_ids(&self) -> Vec<TestId> {
        self.new_failures
            .iter()
            .map(|f| f.failure.test.clone())
            .collect()
    }

    /// e.g. `3 of 4 shards reported`.
    pub fn coverage_line(&self) -> String {
        format!(
            "{} of {} shards reported",
            self.reported_count(),
            self.expected_shards
        )
    }
}
