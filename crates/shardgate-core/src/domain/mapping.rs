//! Persisted association between source files and the tests exercising them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::change_set::normalize_path;
use super::test_id::TestId;

pub const MAPPING_SCHEMA_VERSION: u32 = 1;

/// File path → set of test identifiers.
///
/// Associations only ever grow by set union, so replaying a commit that was
/// already indexed leaves the mapping unchanged. Stale identifiers are removed
/// by [`TestMapping::prune`], never at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMapping {
    pub schema_version: u32,
    #[serde(default)]
    files: BTreeMap<String, BTreeSet<TestId>>,
    #[serde(default)]
    indexed_commits: BTreeSet<String>,
}

impl Default for TestMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl TestMapping {
    pub fn new() -> Self {
        Self {
            schema_version: MAPPING_SCHEMA_VERSION,
            files: BTreeMap::new(),
            indexed_commits: BTreeSet::new(),
        }
    }

    /// Tests associated with `path`, if the path has an entry.
    pub fn tests_for(&self, path: &str) -> Option<&BTreeSet<TestId>> {
        self.files.get(path)
    }

    /// Union `tests` into the entry for `path`. Returns how many were new.
    pub fn associate<'a, I>(&mut self, path: &str, tests: I) -> usize
    where
        I: IntoIterator<Item = &'a TestId>,
    {
        let path = normalize_path(path);
        if path.is_empty() {
            return 0;
        }
        let mut iter = tests.into_iter().peekable();
        if iter.peek().is_none() {
            return 0;
        }
        let entry = self.files.entry(path).or_default();
        iter.filter(|t| entry.insert((*t).clone())).count()
    }

    pub fn is_indexed(&self, sha: &str) -> bool {
        self.indexed_commits.contains(sha)
    }

    pub fn mark_indexed(&mut self, sha: &str) {
        self.indexed_commits.insert(sha.to_string());
    }

    pub fn indexed_commit_count(&self) -> usize {
        self.indexed_commits.len()
    }

    /// Drop identifiers not in `inventory`; files left without tests go too.
    /// Returns the number of (file, test) associations removed.
    pub fn prune(&mut self, inventory: &BTreeSet<TestId>) -> usize {
        let mut removed = 0;
        self.files.retain(|_, tests| {
            let before = tests.len();
            tests.retain(|t| inventory.contains(t));
            removed += before - tests.len();
            !tests.is_empty()
        });
        removed
    }

    /// Every test identifier appearing anywhere in the mapping.
    pub fn all_tests(&self) -> BTreeSet<TestId> {
        self.files.values().flatten().cloned().collect()
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &BTreeSet<TestId>)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// SHA-256 over the associations in canonical (sorted) order.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, tests) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            for test in tests {
                hasher.update(test.as_str().as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
