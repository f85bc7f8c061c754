//! Selected tests and their partition into shards.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{Result, ShardgateError};
use super::test_id::TestId;

/// How a selection is split into shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// The test at sorted position `k` goes to shard `k mod N`.
    RoundRobin,
}

/// One parallel partition of the selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Zero-based shard index.
    pub index: usize,
    pub tests: Vec<TestId>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Ordered, deduplicated tests selected for a pull request, partitioned into
/// exactly `shards.len()` disjoint shards that together cover `tests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSelection {
    pub tests: Vec<TestId>,
    pub shards: Vec<Shard>,
    pub strategy: PartitionStrategy,
    /// Changed paths with no mapping entry that were covered by the fallback.
    #[serde(default)]
    pub fallback_paths: Vec<String>,
    /// SHA-256 over the partition; identical inputs give identical digests.
    pub digest: String,
}

impl TestSelection {
    /// Partition sorted, deduplicated `tests` round-robin into `shard_count`
    /// shards.
    pub fn partition(
        tests: Vec<TestId>,
        shard_count: usize,
        fallback_paths: Vec<String>,
    ) -> Result<Self> {
        if shard_count == 0 {
            return Err(ShardgateError::InvalidShardCount(shard_count));
        }

        let mut shards: Vec<Shard> = (0..shard_count)
            .map(|index| Shard {
                index,
                tests: Vec::new(),
            })
            .collect();
        for (k, test) in tests.iter().enumerate() {
            shards[k % shard_count].tests.push(test.clone());
        }

        let digest = compute_partition_digest(&shards);
        Ok(Self {
            tests,
            shards,
            strategy: PartitionStrategy::RoundRobin,
            fallback_paths,
            digest,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }
}

fn compute_partition_digest(shards: &[Shard]) -> String {
    let mut hasher = Sha256::new();
    for shard in shards {
        hasher.update(shard.index.to_le_bytes());
        for test in &shard.tests {
            hasher.update(test.as_str().as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
