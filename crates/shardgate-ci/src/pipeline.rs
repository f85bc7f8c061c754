//! Shard jobs and the local scatter-gather pipeline.
//!
//! A shard job runs one shard, classifies its failures and leaves its
//! artifacts in the artifact directory. Aggregation only reads that
//! directory, so the same code serves a CI matrix (one job per machine, the
//! directory assembled by artifact upload) and a local run (all shards as
//! tasks of one process).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use shardgate_core::artifact::{
    clear_artifact_dir, clear_shard_artifacts, write_new_failures, write_unavailable,
};
use shardgate_core::metrics::METRICS;
use shardgate_core::{
    collect_shard_inputs, evaluate_gate, read_shard_results, write_report, write_shard_results,
    Aggregator, Backend, BaselineComparator, BaselineLookup, CombinedReport, GateVerdict,
    NewFailureReport, RecordedBaseline, ReportPaths, Shard, ShardResult, TestSelection,
    TieredBaseline,
};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::baseline_exec::ExecutingBaseline;
use crate::config::RunConfig;
use crate::engine::TestEngine;
use crate::error::{CiError, Result};
use crate::runner::{CancelToken, ShardRunner};
use crate::skips::SkipList;

/// What a shard job left behind.
#[derive(Debug, Clone)]
pub enum ShardJobOutcome {
    Completed {
        result: ShardResult,
        report: NewFailureReport,
    },
    /// The execution environment failed; an unavailable marker was written.
    Unavailable { reason: String },
}

/// Run `shard`, classify its failures and write its artifacts.
///
/// Artifacts left in `artifact_dir` for this shard index by an earlier
/// attempt are removed first. Environment failures are not errors here:
/// they produce the shard's unavailable marker. Cancellation returns
/// [`CiError::Cancelled`] and writes nothing.
pub async fn execute_shard(
    runner: &ShardRunner,
    comparator: &BaselineComparator,
    shard: &Shard,
    shard_count: usize,
    artifact_dir: &Path,
    cancel: &mut CancelToken,
) -> Result<ShardJobOutcome> {
    clear_shard_artifacts(artifact_dir, shard.index)?;
    let started_at = Utc::now();
    match runner.run(shard, shard_count, cancel).await {
        Ok(result) => {
            let report = comparator.classify(&result).await;
            if cancel.is_cancelled() {
                return Err(CiError::Cancelled);
            }
            write_shard_results(artifact_dir, &result, started_at)?;
            write_new_failures(artifact_dir, &report)?;
            Ok(ShardJobOutcome::Completed { result, report })
        }
        Err(e) if e.is_environment_failure() => {
            let reason = e.to_string();
            warn!(shard = shard.index, reason = %reason, "shard environment failed");
            write_unavailable(artifact_dir, shard.index, &reason)?;
            Ok(ShardJobOutcome::Unavailable { reason })
        }
        Err(e) => Err(e),
    }
}

/// Output of aggregating an artifact directory.
#[derive(Debug, Clone)]
pub struct AggregateOutput {
    pub report: CombinedReport,
    pub verdict: GateVerdict,
    pub paths: ReportPaths,
}

/// Collect `expected` shards from `artifact_dir`, aggregate, evaluate the
/// gate and write the final report into `report_dir`.
pub fn aggregate_dir(
    artifact_dir: &Path,
    expected: usize,
    report_dir: &Path,
    run_id: &str,
) -> anyhow::Result<AggregateOutput> {
    let inputs = collect_shard_inputs(artifact_dir, expected)
        .with_context(|| format!("collect artifacts from {}", artifact_dir.display()))?;
    let report = Aggregator::new(expected)?.aggregate(
        &inputs.results,
        &inputs.reports,
        &inputs.unavailable,
    )?;
    let verdict = evaluate_gate(&report);
    let paths = write_report(report_dir, run_id, &report, &verdict)
        .with_context(|| format!("write report to {}", report_dir.display()))?;
    info!(
        coverage = %report.coverage_line(),
        new_failures = report.new_failures.len(),
        passed = verdict.passed,
        "{}",
        verdict.message
    );
    Ok(AggregateOutput {
        report,
        verdict,
        paths,
    })
}

/// Directory holding `backend`'s baseline results under `dir`: the
/// `<backend>/artifacts` subdirectory a multi-backend run leaves behind when
/// present, `dir` itself otherwise.
pub fn baseline_results_dir(dir: &Path, backend: Backend) -> PathBuf {
    let per_backend = dir.join(backend.name()).join("artifacts");
    if per_backend.is_dir() {
        per_backend
    } else {
        dir.to_path_buf()
    }
}

/// `backend`'s outcomes from every readable results file for it under
/// `dir`, for use as a recorded baseline. Results of other backends,
/// truncated and malformed files are skipped.
pub fn load_recorded_baseline(dir: &Path, backend: Backend) -> Result<RecordedBaseline> {
    let dir = baseline_results_dir(dir, backend);
    let mut results = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let is_results = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".results.jsonl"));
        if !is_results {
            continue;
        }
        match read_shard_results(&path) {
            Ok(result) => results.push(result),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping baseline artifact"),
        }
    }
    let baseline = RecordedBaseline::from_results(&results, backend);
    info!(
        dir = %dir.display(),
        backend = %backend,
        tests = baseline.len(),
        "loaded recorded baseline"
    );
    Ok(baseline)
}

/// Build the baseline lookup described by `config`.
///
/// Recorded outcomes are consulted first; misses are executed on the
/// baseline checkout when one is configured.
pub fn baseline_from_config(
    config: &RunConfig,
    backend: Backend,
) -> Result<Arc<dyn BaselineLookup>> {
    let recorded = match &config.baseline_results {
        Some(dir) => load_recorded_baseline(dir, backend)?,
        None => RecordedBaseline::default(),
    };
    match config.baseline_engine()? {
        Some(engine) => {
            let executor = Arc::new(ExecutingBaseline::new(Arc::new(engine), backend));
            Ok(Arc::new(TieredBaseline::new(recorded, executor)))
        }
        None => {
            if recorded.is_empty() {
                warn!("no baseline configured; every failure will be reported as new");
            }
            Ok(Arc::new(recorded))
        }
    }
}

/// Result of a complete local pipeline run for one backend.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,
    pub backend: Backend,
    pub selection_digest: String,
    pub report: CombinedReport,
    pub verdict: GateVerdict,
    pub paths: ReportPaths,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }
}

/// Runs every shard of a selection as concurrent tasks, then aggregates.
pub struct LocalPipeline {
    engine: Arc<dyn TestEngine>,
    baseline: Arc<dyn BaselineLookup>,
    skips: SkipList,
    shard_timeout_secs: u64,
    baseline_concurrency: usize,
}

impl LocalPipeline {
    pub fn new(engine: Arc<dyn TestEngine>, baseline: Arc<dyn BaselineLookup>) -> Self {
        Self {
            engine,
            baseline,
            skips: SkipList::default(),
            shard_timeout_secs: 0,
            baseline_concurrency: BaselineComparator::DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_skips(mut self, skips: SkipList) -> Self {
        self.skips = skips;
        self
    }

    pub fn with_shard_timeout(mut self, secs: u64) -> Self {
        self.shard_timeout_secs = secs;
        self
    }

    pub fn with_baseline_concurrency(mut self, n: usize) -> Self {
        self.baseline_concurrency = n;
        self
    }

    /// Engine, skip list, timeouts and baseline as `config` describes them.
    pub fn from_config(config: &RunConfig, backend: Backend) -> Result<Self> {
        let skips = match &config.skip_file {
            Some(path) => SkipList::load(path)?,
            None => SkipList::default(),
        };
        Ok(Self::new(
            Arc::new(config.command_engine()?),
            baseline_from_config(config, backend)?,
        )
        .with_skips(skips)
        .with_shard_timeout(config.shard_timeout_secs)
        .with_baseline_concurrency(config.baseline_concurrency))
    }

    /// Runner for a single shard job on `backend`.
    pub fn runner(&self, backend: Backend) -> ShardRunner {
        ShardRunner::new(Arc::clone(&self.engine), backend)
            .with_skips(self.skips.clone())
            .with_shard_timeout(self.shard_timeout_secs)
    }

    pub fn comparator(&self) -> BaselineComparator {
        BaselineComparator::new(Arc::clone(&self.baseline))
            .with_concurrency(self.baseline_concurrency)
    }

    /// Run all shards of `selection` on `backend`.
    ///
    /// Shard artifacts go to `out_dir/artifacts`, the final report to
    /// `out_dir`. Shard artifacts from an earlier run in `out_dir` are
    /// removed before any shard starts. A crashed shard task leaves no artifacts and is reported
    /// missing; cancellation aborts the run without a report.
    pub async fn run(
        &self,
        selection: &TestSelection,
        backend: Backend,
        out_dir: &Path,
        cancel: CancelToken,
    ) -> anyhow::Result<PipelineResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("shardgate.run", run_id = %run_id, backend = %backend);
        self.run_inner(run_id, selection, backend, out_dir, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        selection: &TestSelection,
        backend: Backend,
        out_dir: &Path,
        cancel: CancelToken,
    ) -> anyhow::Result<PipelineResult> {
        let start = Instant::now();
        let shard_count = selection.shard_count();
        let artifact_dir: PathBuf = out_dir.join("artifacts");
        std::fs::create_dir_all(&artifact_dir)
            .with_context(|| format!("create {}", artifact_dir.display()))?;
        let stale = clear_artifact_dir(&artifact_dir)
            .with_context(|| format!("clear {}", artifact_dir.display()))?;
        if stale > 0 {
            info!(files = stale, "removed artifacts of a previous run");
        }

        info!(
            tests = selection.len(),
            shards = shard_count,
            digest = %selection.digest,
            "starting local pipeline"
        );

        let runner = Arc::new(self.runner(backend));
        let comparator = Arc::new(self.comparator());
        let mut join_set = JoinSet::new();
        for shard in selection.shards.iter().cloned() {
            let runner = Arc::clone(&runner);
            let comparator = Arc::clone(&comparator);
            let artifact_dir = artifact_dir.clone();
            let mut cancel = cancel.clone();
            join_set.spawn(async move {
                let outcome = execute_shard(
                    &runner,
                    &comparator,
                    &shard,
                    shard_count,
                    &artifact_dir,
                    &mut cancel,
                )
                .await;
                (shard.index, outcome)
            });
        }

        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((_, Err(CiError::Cancelled))) => cancelled = true,
                Ok((index, Err(e))) => {
                    warn!(shard = index, error = %e, "shard job failed; shard will be missing")
                }
                Err(e) => warn!(error = %e, "shard task panicked; shard will be missing"),
            }
        }
        if cancelled {
            return Err(CiError::Cancelled.into());
        }

        let output = aggregate_dir(&artifact_dir, shard_count, out_dir, &run_id)?;
        METRICS.flush();

        Ok(PipelineResult {
            run_id,
            backend,
            selection_digest: selection.digest.clone(),
            report: output.report,
            verdict: output.verdict,
            paths: output.paths,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Run `selection` through one pipeline per backend, concurrently.
///
/// Each backend gets its own `out_root/<backend>` directory and its own gate.
pub async fn run_backends(
    pipelines: &[(Backend, LocalPipeline)],
    selection: &TestSelection,
    out_root: &Path,
    cancel: CancelToken,
) -> anyhow::Result<Vec<PipelineResult>> {
    let runs = pipelines.iter().map(|(backend, pipeline)| {
        let backend = *backend;
        let out_dir = out_root.join(backend.name());
        let cancel = cancel.clone();
        async move {
            pipeline
                .run(selection, backend, &out_dir, cancel)
                .await
                .with_context(|| format!("pipeline for backend {backend}"))
        }
    });
    futures::future::join_all(runs).await.into_iter().collect()
}
