//! Errors raised while configuring and executing shards.

use std::path::PathBuf;

use shardgate_core::ShardgateError;

#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("engine command is empty")]
    EmptyCommand,

    #[error("test engine {program:?} not found")]
    EngineNotFound { program: String },

    #[error("failed to launch engine for {test}: {source}")]
    Spawn {
        test: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shard {shard} exceeded its {secs}s timeout")]
    ShardTimeout { shard: usize, secs: u64 },

    #[error("shard execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] ShardgateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiError {
    /// The shard's execution environment failed: the shard is reported as
    /// unavailable instead of failing the whole run.
    pub fn is_environment_failure(&self) -> bool {
        matches!(
            self,
            CiError::EngineNotFound { .. }
                | CiError::Spawn { .. }
                | CiError::EmptyCommand
                | CiError::ShardTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_failures() {
        assert!(CiError::EngineNotFound {
            program: "pytest".to_string()
        }
        .is_environment_failure());
        assert!(CiError::ShardTimeout { shard: 1, secs: 5 }.is_environment_failure());
        assert!(!CiError::Cancelled.is_environment_failure());
        assert!(!CiError::Config("x".to_string()).is_environment_failure());
    }
}
