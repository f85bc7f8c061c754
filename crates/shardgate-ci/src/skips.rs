//! Known-skip list: tests that are recorded as skipped without running.

use std::path::Path;

use shardgate_core::TestId;

use crate::error::Result;

/// Prefixes of test ids that must not be executed.
///
/// File format: one prefix per line, `#` starts a comment line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipList {
    prefixes: Vec<String>,
}

impl SkipList {
    pub fn parse(content: &str) -> Self {
        let mut prefixes: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        prefixes.sort();
        prefixes.dedup();
        Self { prefixes }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// The prefix that matches `test`, if any.
    pub fn matching(&self, test: &TestId) -> Option<&str> {
        self.prefixes
            .iter()
            .find(|p| test.starts_with(p))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
