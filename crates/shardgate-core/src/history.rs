//! History indexer: derives file → test associations from commit history.
//!
//! Each [`CommitRecord`] says which paths changed together with which tests
//! ran or were modified in that commit. [`HistoryIndexer::update`] unions
//! those co-occurrences into a [`TestMapping`]. When the history source
//! fails, the last known-good mapping is returned and the outcome is marked
//! degraded instead of failing the pipeline.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{normalize_path, Result, ShardgateError, TestId, TestMapping};
use crate::obs::emit_mapping_indexed;

/// A commit range such as `origin/main~500..origin/main`, bounded in depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRange {
    pub spec: String,
    /// Walk at most this many commits.
    #[serde(default)]
    pub max_commits: Option<usize>,
}

impl CommitRange {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            max_commits: None,
        }
    }

    pub fn with_depth(mut self, max_commits: usize) -> Self {
        self.max_commits = Some(max_commits);
        self
    }
}

/// Co-occurrence of changed paths and tests in one historical commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub changed_paths: Vec<String>,
    #[serde(default)]
    pub tests_run: Vec<TestId>,
}

/// Source of historical commit/test data.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Return the commits in `range`, or an error when history is unavailable
    /// or malformed.
    async fn commits(&self, range: &CommitRange) -> Result<Vec<CommitRecord>>;
}

/// Recognises test files among changed paths and names the tests in them.
#[derive(Debug, Clone)]
pub struct TestLocator {
    pattern: Regex,
}

impl TestLocator {
    /// Matches `tests/`, `test/`, `*_tests/` directories and `test_*` files.
    pub const DEFAULT_PATTERN: &'static str = r"(^|/)([A-Za-z0-9]+_)?tests?/|(^|/)test_[^/]+$";

    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| ShardgateError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    pub fn default_locator() -> Self {
        Self {
            pattern: Regex::new(Self::DEFAULT_PATTERN).expect("default test pattern is valid"),
        }
    }

    pub fn is_test_path(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// A file-level test id for a changed test file, `None` for source files.
    pub fn test_id_for(&self, path: &str) -> Option<TestId> {
        let path = normalize_path(path);
        if !self.is_test_path(&path) || path.ends_with('/') {
            return None;
        }
        TestId::new(path).ok()
    }
}

/// Commit/test co-occurrence records collected by CI, one JSON
/// [`CommitRecord`] per line. `max_commits` keeps the first N records.
pub struct RecordedHistorySource {
    path: PathBuf,
}

impl RecordedHistorySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl HistorySource for RecordedHistorySource {
    async fn commits(&self, range: &CommitRange) -> Result<Vec<CommitRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ShardgateError::History(format!("read {}: {e}", self.path.display()))
        })?;
        parse_commit_records(&content, range.max_commits)
    }
}

/// Parse JSON-lines commit records; blank lines and `#` comments are skipped.
pub fn parse_commit_records(content: &str, limit: Option<usize>) -> Result<Vec<CommitRecord>> {
    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if limit.is_some_and(|max| records.len() >= max) {
            break;
        }
        let record: CommitRecord = serde_json::from_str(line).map_err(|e| {
            ShardgateError::History(format!("malformed commit record on line {}: {e}", lineno + 1))
        })?;
        if record.sha.trim().is_empty() {
            return Err(ShardgateError::History(format!(
                "commit record on line {} has an empty sha",
                lineno + 1
            )));
        }
        records.push(record);
    }
    Ok(records)
}

/// Counts from applying commits to a mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub commits_indexed: usize,
    /// Commits already present in the mapping.
    pub commits_skipped: usize,
    pub associations_added: usize,
}

/// Union each unseen commit's co-occurrences into `mapping`.
///
/// Every changed path, test files included, is associated with every test
/// the commit ran. Commits already indexed are skipped.
pub fn apply_commits(mapping: &mut TestMapping, commits: &[CommitRecord]) -> ApplyStats {
    let mut stats = ApplyStats::default();
    for commit in commits {
        if mapping.is_indexed(&commit.sha) {
            stats.commits_skipped += 1;
            continue;
        }
        for path in &commit.changed_paths {
            stats.associations_added += mapping.associate(path, &commit.tests_run);
        }
        mapping.mark_indexed(&commit.sha);
        stats.commits_indexed += 1;
        debug!(
            sha = %commit.sha,
            paths = commit.changed_paths.len(),
            tests = commit.tests_run.len(),
            "indexed commit"
        );
    }
    stats
}

/// Result of an indexer update.
#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub mapping: TestMapping,
    /// `true` when history was unavailable and `mapping` is the last
    /// known-good one.
    pub degraded: bool,
    pub warning: Option<String>,
    pub stats: ApplyStats,
    /// Associations removed because their test no longer exists.
    pub pruned: usize,
}

/// Builds and maintains the [`TestMapping`].
pub struct HistoryIndexer {
    source: Arc<dyn HistorySource>,
}

impl HistoryIndexer {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self { source }
    }

    /// Index `range` on top of `last_known`, optionally pruning identifiers
    /// missing from `inventory`.
    ///
    /// Never fails: history errors yield the unchanged last known-good
    /// mapping (empty if there is none) with `degraded = true`.
    pub async fn update(
        &self,
        last_known: Option<TestMapping>,
        range: &CommitRange,
        inventory: Option<&BTreeSet<TestId>>,
    ) -> IndexOutcome {
        let degraded_base = last_known.is_none();
        let mut mapping = last_known.unwrap_or_default();

        let commits = match self.source.commits(range).await {
            Ok(commits) => commits,
            Err(e) => {
                let warning = format!(
                    "history unavailable for {}: {e}; using last known mapping ({} files)",
                    range.spec,
                    mapping.file_count()
                );
                warn!(range = %range.spec, error = %e, "mapping is stale");
                emit_mapping_indexed(mapping.file_count(), 0, true);
                return IndexOutcome {
                    mapping,
                    degraded: true,
                    warning: Some(warning),
                    stats: ApplyStats::default(),
                    pruned: 0,
                };
            }
        };

        let stats = apply_commits(&mut mapping, &commits);
        let pruned = inventory.map_or(0, |inv| mapping.prune(inv));
        if pruned > 0 {
            info!(pruned = pruned, "pruned stale test associations");
        }
        if degraded_base {
            debug!("no previous mapping; indexed from scratch");
        }
        emit_mapping_indexed(mapping.file_count(), stats.commits_indexed, false);

        IndexOutcome {
            mapping,
            degraded: false,
            warning: None,
            stats,
            pruned,
        }
    }
}
