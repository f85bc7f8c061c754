//! CI job matrix over backends × shards.

use serde::{Deserialize, Serialize};
use shardgate_core::Backend;

use crate::error::{CiError, Result};

/// One job of the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCell {
    pub job: usize,
    pub backend: Backend,
    /// Zero-based.
    pub shard_index: usize,
    pub shard_count: usize,
}

/// `backends.len() × shard_count` jobs. Job `j` runs backend
/// `backends[(j mod B·N) / N]`, shard `j mod N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMatrix {
    backends: Vec<Backend>,
    shard_count: usize,
}

impl RunMatrix {
    pub fn new(backends: Vec<Backend>, shard_count: usize) -> Result<Self> {
        if backends.is_empty() {
            return Err(CiError::Config("run matrix needs at least one backend".to_string()));
        }
        if shard_count == 0 {
            return Err(CiError::Config("shard count must be at least 1".to_string()));
        }
        Ok(Self {
            backends,
            shard_count,
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len() * self.shard_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cell for CI job index `job`. Indices past the end wrap around.
    pub fn cell(&self, job: usize) -> MatrixCell {
        let n = self.shard_count;
        let wrapped = job % self.len();
        MatrixCell {
            job,
            backend: self.backends[wrapped / n],
            shard_index: job % n,
            shard_count: n,
        }
    }

    pub fn cells(&self) -> impl Iterator<Item = MatrixCell> + '_ {
        (0..self.len()).map(|j| self.cell(j))
    }
}
