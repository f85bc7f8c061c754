//! Run configuration (`shardgate.toml`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shardgate_core::{Backend, FallbackPolicy, PathFilter, TestLocator};

use crate::engine::CommandEngine;
use crate::error::{CiError, Result};

/// How each test is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// argv template; `{test}` and `{backend}` are substituted.
    pub argv: Vec<String>,
    /// Per-test timeout in seconds (0 = none).
    pub test_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            argv: [
                "python",
                "-m",
                "pytest",
                "{test}",
                "--backend={backend}",
                "-q",
                "-p",
                "no:cacheprovider",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            test_timeout_secs: 600,
        }
    }
}

/// Parameters of a selection/execution run.
///
/// Every field has a default, so an empty file is a valid configuration.
/// CLI flags override file values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Backend for single-shard jobs.
    pub backend: Backend,
    /// Backends covered by the run matrix; empty means just `backend`.
    pub backends: Vec<Backend>,
    pub shard_count: usize,
    /// Maximum commits the history indexer walks per update.
    pub history_depth: Option<usize>,
    pub fallback: FallbackPolicy,
    /// Regexes for changed paths that never impact tests.
    pub ignore_patterns: Vec<String>,
    /// Regex recognising test files among changed paths.
    pub test_path_pattern: String,
    pub skip_file: Option<PathBuf>,
    pub mapping_path: PathBuf,
    pub artifact_dir: PathBuf,
    /// Artifact directory of a target-branch run, used as recorded baseline.
    pub baseline_results: Option<PathBuf>,
    /// Checkout of the baseline revision for executing baseline misses.
    pub baseline_workdir: Option<PathBuf>,
    pub engine: EngineConfig,
    /// Whole-shard timeout in seconds (0 = none).
    pub shard_timeout_secs: u64,
    pub baseline_concurrency: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Numpy,
            backends: Vec::new(),
            shard_count: 4,
            history_depth: Some(1000),
            fallback: FallbackPolicy::default(),
            ignore_patterns: vec![
                r"^docs/".to_string(),
                r"\.md$".to_string(),
                r"\.rst$".to_string(),
            ],
            test_path_pattern: TestLocator::DEFAULT_PATTERN.to_string(),
            skip_file: None,
            mapping_path: PathBuf::from(".shardgate/mapping.json"),
            artifact_dir: PathBuf::from(".shardgate/artifacts"),
            baseline_results: None,
            baseline_workdir: None,
            engine: EngineConfig::default(),
            shard_timeout_secs: 0,
            baseline_concurrency: 4,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content).map_err(|source| CiError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, the defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(CiError::Config("shard_count must be at least 1".to_string()));
        }
        if self.baseline_concurrency == 0 {
            return Err(CiError::Config(
                "baseline_concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.argv.is_empty() {
            return Err(CiError::EmptyCommand);
        }
        if !self.engine.argv.iter().any(|a| a.contains("{test}")) {
            return Err(CiError::Config(
                "engine argv must contain a {test} placeholder".to_string(),
            ));
        }
        if let FallbackPolicy::SiblingModule { depth: 0 } = self.fallback {
            return Err(CiError::Config(
                "sibling_module fallback depth must be at least 1".to_string(),
            ));
        }
        self.path_filter()?;
        self.test_locator()?;
        Ok(())
    }

    pub fn backends(&self) -> Vec<Backend> {
        if self.backends.is_empty() {
            vec![self.backend]
        } else {
            self.backends.clone()
        }
    }

    pub fn path_filter(&self) -> Result<PathFilter> {
        Ok(PathFilter::new(&self.ignore_patterns)?)
    }

    pub fn test_locator(&self) -> Result<TestLocator> {
        Ok(TestLocator::new(&self.test_path_pattern)?)
    }

    /// Engine for PR runs.
    pub fn command_engine(&self) -> Result<CommandEngine> {
        Ok(CommandEngine::new(self.engine.argv.clone())?
            .with_timeout(self.engine.test_timeout_secs))
    }

    /// Engine for baseline executions, if a baseline checkout is configured.
    pub fn baseline_engine(&self) -> Result<Option<CommandEngine>> {
        match &self.baseline_workdir {
            Some(dir) => Ok(Some(self.command_engine()?.with_workdir(dir))),
            None => Ok(None),
        }
    }

    /// SHA-256 over the settings that influence selection and execution.
    pub fn digest(&self) -> String {
        let canonical = serde_json::json!({
            "shard_count": self.shard_count,
            "fallback": &self.fallback,
            "ignore_patterns": &self.ignore_patterns,
            "test_path_pattern": &self.test_path_pattern,
            "engine": &self.engine.argv,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
