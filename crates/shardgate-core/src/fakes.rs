//! In-memory fakes for the history and baseline seams (testing only).
//!
//! `MemoryHistorySource` and `CountingBaseline` satisfy the trait contracts
//! without git or a test-execution engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::baseline::BaselineLookup;
use crate::domain::{Outcome, Result, ShardgateError, TestId};
use crate::history::{CommitRange, CommitRecord, HistorySource};

// ---------------------------------------------------------------------------
// MemoryHistorySource
// ---------------------------------------------------------------------------

/// Fixed commit records, or a fixed failure.
#[derive(Debug, Clone)]
pub struct MemoryHistorySource {
    commits: std::result::Result<Vec<CommitRecord>, String>,
}

impl MemoryHistorySource {
    pub fn new(commits: Vec<CommitRecord>) -> Self {
        Self {
            commits: Ok(commits),
        }
    }

    /// A source whose history is always unavailable.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            commits: Err(reason.into()),
        }
    }
}

#[async_trait]
impl HistorySource for MemoryHistorySource {
    async fn commits(&self, range: &CommitRange) -> Result<Vec<CommitRecord>> {
        match &self.commits {
            Ok(commits) => {
                let limit = range.max_commits.unwrap_or(commits.len());
                Ok(commits.iter().take(limit).cloned().collect())
            }
            Err(reason) => Err(ShardgateError::History(reason.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// CountingBaseline
// ---------------------------------------------------------------------------

/// Baseline fixture that counts how often it is consulted.
#[derive(Debug, Default)]
pub struct CountingBaseline {
    outcomes: BTreeMap<TestId, Outcome>,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl CountingBaseline {
    pub fn new(outcomes: BTreeMap<TestId, Outcome>) -> Self {
        Self {
            outcomes,
            ..Self::default()
        }
    }

    /// Every lookup fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BaselineLookup for CountingBaseline {
    async fn lookup(&self, test: &TestId) -> Result<Option<Outcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(reason) => Err(ShardgateError::Baseline {
                test: test.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(self.outcomes.get(test).copied()),
        }
    }
}
