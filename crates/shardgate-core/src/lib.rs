//! Shardgate Core Library
//!
//! Change-aware test selection and regression gating:
//! - index commit history into a file → tests mapping
//! - resolve a change set into impacted tests, partitioned into shards
//! - classify shard failures against a baseline (new vs pre-existing)
//! - aggregate shard artifacts into one report and evaluate the gate

pub mod aggregate;
pub mod artifact;
pub mod baseline;
pub mod domain;
pub mod fakes;
pub mod gate;
pub mod git;
pub mod history;
pub mod metrics;
pub mod obs;
pub mod reporting;
pub mod resolver;
pub mod store;
pub mod telemetry;

pub use domain::{
    normalize_path, Backend, ChangeSet, CombinedReport, FailureClass, NewFailure,
    NewFailureReport, Outcome, OutcomeCounts, PartitionStrategy, PathFilter, Result, Shard,
    ShardFailure, ShardResult, ShardStatus, ShardSummary, ShardgateError, TestId, TestMapping,
    TestRecord, TestSelection, MAPPING_SCHEMA_VERSION,
};

pub use aggregate::{Aggregator, UnavailableShard};
pub use artifact::{collect_shard_inputs, read_shard_results, write_shard_results, ShardInputs};
pub use baseline::{
    classify_failure, BaselineComparator, BaselineLookup, RecordedBaseline, TieredBaseline,
};
pub use gate::{evaluate_gate, GateVerdict};
pub use git::{capture_head_sha, diff_change_set, is_git_repo, GitHistorySource};
pub use history::{
    apply_commits, CommitRange, CommitRecord, HistoryIndexer, HistorySource, IndexOutcome,
    RecordedHistorySource, TestLocator,
};
pub use metrics::METRICS;
pub use reporting::{render_report_md, write_report, ReportPaths};
pub use resolver::{FallbackPolicy, ImpactResolver};
pub use store::MappingStore;
pub use telemetry::{init_tracing, log_level};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
