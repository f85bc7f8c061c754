//! Domain-level error taxonomy for shardgate.

use std::path::PathBuf;

/// Shardgate domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ShardgateError {
    #[error("invalid test id: {0:?}")]
    InvalidTestId(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("unknown outcome: {0}")]
    UnknownOutcome(String),

    #[error("invalid path pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("test mapping unavailable: {0}")]
    MappingUnavailable(String),

    #[error("history error: {0}")]
    History(String),

    #[error("git error: {0}")]
    GitError(String),

    #[error("invalid shard count: {0} (must be at least 1)")]
    InvalidShardCount(usize),

    #[error("shard index {index} out of range for {expected} shard(s)")]
    ShardOutOfRange { index: usize, expected: usize },

    #[error("duplicate report for shard {0}")]
    DuplicateShard(usize),

    #[error("baseline lookup failed for {test}: {reason}")]
    Baseline { test: String, reason: String },

    #[error("malformed artifact {path:?}: {reason}")]
    Artifact { path: PathBuf, reason: String },

    #[error("truncated artifact {0:?}: completion footer missing")]
    TruncatedArtifact(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shardgate domain operations.
pub type Result<T> = std::result::Result<T, ShardgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_out_of_range_display() {
        let err = ShardgateError::ShardOutOfRange {
            index: 7,
            expected: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("4 shard"));
    }

    #[test]
    fn test_mapping_unavailable_display() {
        let err = ShardgateError::MappingUnavailable("blob missing".to_string());
        assert!(err.to_string().contains("test mapping unavailable"));
        assert!(err.to_string().contains("blob missing"));
    }

    #[test]
    fn test_truncated_artifact_display() {
        let err = ShardgateError::TruncatedArtifact(PathBuf::from("shard-1.results.jsonl"));
        assert!(err.to_string().contains("footer missing"));
    }
}
