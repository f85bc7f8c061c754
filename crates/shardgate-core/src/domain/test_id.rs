//! Test identifiers, outcomes and execution backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, ShardgateError};

/// Uniquely names one test function or module, e.g.
/// `tests/test_core/test_elementwise.py::test_abs`.
///
/// Ordering is lexicographic on the raw identifier, which is what shard
/// assignment relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestId(String);

impl TestId {
    /// Create a test id, trimming surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.contains('\n') {
            return Err(ShardgateError::InvalidTestId(id));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The file component of the id (everything before the first `::`).
    pub fn file(&self) -> &str {
        self.0.split("::").next().unwrap_or(&self.0)
    }

    /// Whether this id equals `prefix` or lives underneath it.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl TryFrom<String> for TestId {
    type Error = ShardgateError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TestId> for String {
    fn from(id: TestId) -> Self {
        id.0
    }
}

impl FromStr for TestId {
    type Err = ShardgateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl Outcome {
    /// `fail` and `error` are the outcomes that can gate a pull request.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Fail | Outcome::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
            Outcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = ShardgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" => Ok(Outcome::Pass),
            "fail" | "failed" => Ok(Outcome::Fail),
            "error" | "errored" => Ok(Outcome::Error),
            "skip" | "skipped" => Ok(Outcome::Skipped),
            other => Err(ShardgateError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Pass/fail/error/skip tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.passed += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Error => self.errored += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.errored + self.skipped
    }

    pub fn failures(&self) -> usize {
        self.failed + self.errored
    }
}

/// Execution backend the test suite is run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Numpy,
    Torch,
    Jax,
    Tensorflow,
    Paddle,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Numpy,
        Backend::Torch,
        Backend::Jax,
        Backend::Tensorflow,
        Backend::Paddle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Numpy => "numpy",
            Backend::Torch => "torch",
            Backend::Jax => "jax",
            Backend::Tensorflow => "tensorflow",
            Backend::Paddle => "paddle",
        }
    }

    /// Parse a comma-separated backend list such as `numpy,torch`.
    pub fn parse_list(list: &str) -> Result<Vec<Backend>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Backend::from_str)
            .collect()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = ShardgateError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        Backend::ALL
            .into_iter()
            .find(|b| b.name() == lowered)
            .ok_or_else(|| ShardgateError::UnknownBackend(s.to_string()))
    }
}
