//! Shardgate CI - shard execution and pipeline orchestration
//!
//! Provides:
//! - a process-per-test engine and the shard runner driving it
//! - baseline execution on the target-branch checkout
//! - the backend × shard job matrix and TOML run configuration
//! - shard jobs and a local scatter-gather pipeline over the core library

pub mod baseline_exec;
pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod matrix;
pub mod pipeline;
pub mod runner;
pub mod skips;

// Re-export key types
pub use baseline_exec::ExecutingBaseline;
pub use config::{EngineConfig, RunConfig};
pub use engine::{CommandEngine, TestEngine, TestExecution};
pub use error::{CiError, Result};
pub use matrix::{MatrixCell, RunMatrix};
pub use pipeline::{
    aggregate_dir, baseline_from_config, baseline_results_dir, execute_shard,
    load_recorded_baseline, run_backends, AggregateOutput, LocalPipeline, PipelineResult,
    ShardJobOutcome,
};
pub use runner::{cancel_pair, CancelHandle, CancelToken, ShardRunner};
pub use skips::SkipList;
