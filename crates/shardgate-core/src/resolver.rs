//! Impact resolver: changed files → impacted tests → shards.
//!
//! Resolution is a pure function of (change set, mapping, shard count,
//! fallback policy). Candidates are unioned, sorted lexicographically and
//! partitioned round-robin, so identical inputs always give the identical
//! partition.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{ChangeSet, Result, TestId, TestMapping, TestSelection};
use crate::metrics::METRICS;
use crate::obs::emit_selection_resolved;

/// What to select for a changed path that has no mapping entry.
///
/// Missing an impacted test costs more than running an extra one, so the
/// default is broad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Select nothing for the path (warning only).
    None,
    /// Every test mapped from a file sharing the path's first `depth`
    /// directory components. Escalates to [`FallbackPolicy::All`] when that
    /// set is empty.
    SiblingModule { depth: usize },
    /// A fixed default set.
    Explicit { tests: Vec<TestId> },
    /// Every test in the mapping.
    All,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::SiblingModule { depth: 1 }
    }
}

/// Directory components of `path` (the file name is dropped).
fn dir_components(path: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    parts.pop();
    parts
}

#[derive(Debug, Clone, Default)]
pub struct ImpactResolver {
    fallback: FallbackPolicy,
}

impl ImpactResolver {
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self { fallback }
    }

    pub fn fallback(&self) -> &FallbackPolicy {
        &self.fallback
    }

    /// Resolve the impacted tests for `changes` and partition them into
    /// `shard_count` shards.
    pub fn resolve(
        &self,
        changes: &ChangeSet,
        mapping: &TestMapping,
        shard_count: usize,
    ) -> Result<TestSelection> {
        let mut candidates: BTreeSet<TestId> = BTreeSet::new();
        let mut fallback_paths = Vec::new();

        for path in changes.iter() {
            match mapping.tests_for(path) {
                Some(tests) => {
                    debug!(path = %path, tests = tests.len(), "mapping hit");
                    candidates.extend(tests.iter().cloned());
                }
                None => {
                    let fallback = self.fallback_for(path, mapping);
                    warn!(
                        path = %path,
                        fallback_tests = fallback.len(),
                        "changed path has no mapping entry; applying fallback"
                    );
                    METRICS.inc_fallback_hits();
                    candidates.extend(fallback);
                    fallback_paths.push(path.to_string());
                }
            }
        }

        let tests: Vec<TestId> = candidates.into_iter().collect();
        let selection = TestSelection::partition(tests, shard_count, fallback_paths)?;
        emit_selection_resolved(
            changes.len(),
            selection.len(),
            selection.shard_count(),
            selection.fallback_paths.len(),
        );
        Ok(selection)
    }

    fn fallback_for(&self, path: &str, mapping: &TestMapping) -> BTreeSet<TestId> {
        match &self.fallback {
            FallbackPolicy::None => BTreeSet::new(),
            FallbackPolicy::Explicit { tests } => tests.iter().cloned().collect(),
            FallbackPolicy::All => mapping.all_tests(),
            FallbackPolicy::SiblingModule { depth } => {
                let dirs = dir_components(path);
                let prefix = &dirs[..(*depth).min(dirs.len())];
                let siblings: BTreeSet<TestId> = mapping
                    .files()
                    .filter(|(file, _)| dir_components(file).starts_with(prefix))
                    .flat_map(|(_, tests)| tests.iter().cloned())
                    .collect();
                if siblings.is_empty() {
                    debug!(path = %path, "no sibling tests; escalating to all tests");
                    mapping.all_tests()
                } else {
                    siblings
                }
            }
        }
    }
}
