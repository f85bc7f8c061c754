//! Per-shard execution results.

use serde::{Deserialize, Serialize};

use super::test_id::{Backend, Outcome, OutcomeCounts, TestId};

/// Outcome of one test in a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test: TestId,
    pub outcome: Outcome,
    /// Wall-clock duration; informational only, never used for gating.
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl TestRecord {
    pub fn new(test: TestId, outcome: Outcome) -> Self {
        Self {
            test,
            outcome,
            duration_ms: 0,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Everything one shard produced. Owned exclusively by its shard runner
/// until handed to the comparator and aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResult {
    pub shard_index: usize,
    pub shard_count: usize,
    pub backend: Backend,
    pub records: Vec<TestRecord>,
}

impl ShardResult {
    pub fn new(shard_index: usize, shard_count: usize, backend: Backend) -> Self {
        Self {
            shard_index,
            shard_count,
            backend,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TestRecord) {
        self.records.push(record);
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in &self.records {
            counts.record(record.outcome);
        }
        counts
    }

    /// Records whose outcome is `fail` or `error`.
    pub fn failures(&self) -> impl Iterator<Item = &TestRecord> {
        self.records.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn record_for(&self, test: &TestId) -> Option<&TestRecord> {
        self.records.iter().find(|r| &r.test == test)
    }

    /// Total wall-clock time spent in tests.
    pub fn duration_ms(&self) -> u64 {
        self.records.iter().map(|r| r.duration_ms).sum()
    }

    /// One-line human summary, e.g. `shard 2/4 [numpy]: 10 passed, 1 failed`.
    pub fn summary_line(&self) -> String {
        let c = self.counts();
        format!(
            "shard {}/{} [{}]: {} passed, {} failed, {} errored, {} skipped",
            self.shard_index + 1,
            self.shard_count,
            self.backend,
            c.passed,
            c.failed,
            c.errored,
            c.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, outcome: Outcome) -> TestRecord {
        TestRecord::new(TestId::new(name).unwrap(), outcome)
    }

    #[test]
    fn counts_and_failures() {
        let mut result = ShardResult::new(0, 2, Backend::Numpy);
        result.push(record("a", Outcome::Pass));
        result.push(record("b", Outcome::Fail).with_diagnostic("assert 1 == 2"));
        result.push(record("c", Outcome::Error));
        result.push(record("d", Outcome::Skipped));

        let counts = result.counts();
        assert_eq!(counts.passed, 1);
        assert_eq!(counts.failures(), 2);
        assert_eq!(result.failures().count(), 2);
        assert_eq!(
            result.summary_line(),
            "shard 1/2 [numpy]: 1 passed, 1 failed, 1 errored, 1 skipped"
        );
    }

    #[test]
    fn diagnostic_omitted_when_absent() {
        let json = serde_json::to_value(record("a", Outcome::Pass).with_duration(12)).unwrap();
        assert!(json.get("diagnostic").is_none());
        assert_eq!(json["duration_ms"], 12);
        assert_eq!(json["outcome"], "pass");
    }
}
