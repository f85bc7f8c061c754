//! Shardgate - change-aware test selection and regression gating CLI
//!
//! The `shardgate` command selects the tests a pull request can affect,
//! runs them in shards and fails only on failures that are new relative to
//! the target branch.
//!
//! ## Commands
//!
//! - `index`: update the file → tests mapping from commit history
//! - `changes`: list the changed paths of a pull request
//! - `select`: resolve changes into a sharded test selection
//! - `run-shard`: run one shard (or one CI matrix job) and write its artifacts
//! - `aggregate`: combine shard artifacts, write the report, evaluate the gate
//! - `pipeline`: select, run every shard locally and aggregate
//! - `matrix`: print the backend × shard job matrix

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use shardgate_ci::{
    aggregate_dir, cancel_pair, execute_shard, run_backends, CancelToken, LocalPipeline,
    RunConfig, RunMatrix, ShardJobOutcome,
};
use shardgate_core::obs::RunSpan;
use shardgate_core::{
    artifact::read_id_list, diff_change_set, log_level, Backend, ChangeSet, CommitRange,
    GitHistorySource, HistoryIndexer, HistorySource, ImpactResolver, MappingStore,
    RecordedHistorySource, TestId, TestMapping, TestSelection,
};

#[derive(Parser, Debug)]
#[command(name = "shardgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Change-aware test selection and sharded regression gating", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Run configuration file (TOML)
    #[arg(short, long, global = true, env = "SHARDGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over the configuration file.
#[derive(Args, Debug, Clone, Default)]
struct ConfigOverrides {
    /// Number of shards
    #[arg(long, global = true, env = "SHARDGATE_SHARDS")]
    shards: Option<usize>,

    /// Backends to run, comma-separated (e.g. numpy,torch)
    #[arg(long, global = true, value_delimiter = ',', env = "SHARDGATE_BACKENDS")]
    backends: Vec<Backend>,

    /// Maximum commits walked by `index`
    #[arg(long, global = true)]
    history_depth: Option<usize>,

    /// Mapping blob location
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,

    /// Root directory for shard artifacts and reports
    #[arg(long, global = true)]
    artifact_dir: Option<PathBuf>,

    /// Artifact directory of a target-branch run to use as recorded baseline
    #[arg(long, global = true)]
    baseline_results: Option<PathBuf>,

    /// Checkout of the target branch for executing baseline misses
    #[arg(long, global = true)]
    baseline_workdir: Option<PathBuf>,

    /// Skip list file
    #[arg(long, global = true)]
    skip_file: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(n) = self.shards {
            config.shard_count = n;
        }
        if !self.backends.is_empty() {
            config.backends = self.backends.clone();
            config.backend = self.backends[0];
        }
        if let Some(depth) = self.history_depth {
            config.history_depth = Some(depth);
        }
        if let Some(p) = &self.mapping {
            config.mapping_path = p.clone();
        }
        if let Some(p) = &self.artifact_dir {
            config.artifact_dir = p.clone();
        }
        if let Some(p) = &self.baseline_results {
            config.baseline_results = Some(p.clone());
        }
        if let Some(p) = &self.baseline_workdir {
            config.baseline_workdir = Some(p.clone());
        }
        if let Some(p) = &self.skip_file {
            config.skip_file = Some(p.clone());
        }
    }
}

/// Where the changed paths come from.
#[derive(Args, Debug, Clone)]
struct ChangeArgs {
    /// Repository root
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Target branch revision
    #[arg(long, default_value = "origin/main")]
    base: String,

    /// Pull request revision
    #[arg(long, default_value = "HEAD")]
    head: String,

    /// Explicit changed paths, comma-separated (skips git)
    #[arg(long, value_delimiter = ',')]
    paths: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update the test mapping from commit history
    Index {
        /// Repository root
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Commit range to walk
        #[arg(long, default_value = "HEAD")]
        range: String,

        /// Read commit records (JSON lines) from this file instead of git
        #[arg(long)]
        history: Option<PathBuf>,

        /// Current test inventory (one id per line); stale tests are pruned
        #[arg(long)]
        inventory: Option<PathBuf>,
    },

    /// List changed paths after ignore patterns
    Changes {
        #[command(flatten)]
        changes: ChangeArgs,
    },

    /// Resolve changes into a sharded test selection (JSON)
    Select {
        #[command(flatten)]
        changes: ChangeArgs,

        /// Write the selection here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one shard of a selection and write its artifacts
    RunShard {
        /// Selection produced by `select`
        #[arg(short, long)]
        selection: PathBuf,

        /// Zero-based shard index
        #[arg(long, conflicts_with = "job", required_unless_present = "job")]
        shard_index: Option<usize>,

        /// CI matrix job index; determines backend and shard
        #[arg(long)]
        job: Option<usize>,

        /// Backend for `--shard-index` runs
        #[arg(long)]
        backend: Option<Backend>,
    },

    /// Aggregate shard artifacts, write the report and evaluate the gate
    Aggregate {
        /// Run identifier recorded in report.json
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Select, run all shards locally and aggregate
    Pipeline {
        #[command(flatten)]
        changes: ChangeArgs,
    },

    /// Print the backend × shard job matrix (JSON)
    Matrix,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // logs go to stderr; stdout is reserved for command output
    shardgate_core::init_tracing(cli.json, log_level(cli.verbose));

    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    match cli.command {
        Commands::Index {
            repo,
            range,
            history,
            inventory,
        } => cmd_index(&config, &repo, &range, history.as_deref(), inventory.as_deref()).await,
        Commands::Changes { changes } => cmd_changes(&config, &changes),
        Commands::Select { changes, output } => {
            cmd_select(&config, &changes, output.as_deref()).map(|_| ())
        }
        Commands::RunShard {
            selection,
            shard_index,
            job,
            backend,
        } => {
            let target = match (job, shard_index) {
                (Some(job), _) => ShardTarget::Job(job),
                (None, Some(index)) => ShardTarget::Shard {
                    index,
                    backend: backend.unwrap_or(config.backend),
                },
                (None, None) => anyhow::bail!("either --shard-index or --job is required"),
            };
            cmd_run_shard(&config, &selection, target, cancel_on_ctrl_c())
                .await
                .map(|_| ())
        }
        Commands::Aggregate { run_id } => cmd_aggregate(&config, run_id.as_deref()),
        Commands::Pipeline { changes } => cmd_pipeline(&config, &changes, cancel_on_ctrl_c()).await,
        Commands::Matrix => cmd_matrix(&config),
    }
}

fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<RunConfig> {
    let mut config = RunConfig::load_or_default(path).context("Failed to load run configuration")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid run configuration")?;
    Ok(config)
}

fn cancel_on_ctrl_c() -> CancelToken {
    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling in-flight shards");
            handle.cancel();
        }
    });
    token
}

/// Per-backend output directory: `<artifact_dir>/<backend>`, with shard
/// artifacts in its `artifacts/` subdirectory.
fn backend_dir(config: &RunConfig, backend: Backend) -> PathBuf {
    config.artifact_dir.join(backend.name())
}

fn change_set(config: &RunConfig, args: &ChangeArgs) -> Result<ChangeSet> {
    let filter = config.path_filter()?;
    if !args.paths.is_empty() {
        return Ok(ChangeSet::filtered(&args.paths, &filter));
    }
    diff_change_set(&args.repo, &args.base, &args.head, &filter)
        .with_context(|| format!("Failed to diff {}...{}", args.base, args.head))
}

fn load_mapping(config: &RunConfig) -> Result<TestMapping> {
    MappingStore::new(&config.mapping_path)
        .load()
        .context("No usable test mapping; run `shardgate index` first")
}

fn resolve(config: &RunConfig, args: &ChangeArgs) -> Result<TestSelection> {
    let changes = change_set(config, args)?;
    let mapping = load_mapping(config)?;
    let selection = ImpactResolver::new(config.fallback.clone())
        .resolve(&changes, &mapping, config.shard_count)
        .context("Failed to resolve test selection")?;
    info!(
        changed = changes.len(),
        selected = selection.len(),
        shards = selection.shard_count(),
        digest = %selection.digest,
        "selection resolved"
    );
    Ok(selection)
}

/// Update the mapping blob from history
async fn cmd_index(
    config: &RunConfig,
    repo: &Path,
    range: &str,
    history: Option<&Path>,
    inventory: Option<&Path>,
) -> Result<()> {
    let store = MappingStore::new(&config.mapping_path);
    let source: Arc<dyn HistorySource> = match history {
        Some(path) => Arc::new(RecordedHistorySource::new(path)),
        None => Arc::new(GitHistorySource::new(repo, config.test_locator()?)),
    };
    let inventory: Option<BTreeSet<TestId>> = match inventory {
        Some(path) => Some(
            read_id_list(path)
                .with_context(|| format!("Failed to read inventory {}", path.display()))?
                .into_iter()
                .collect(),
        ),
        None => None,
    };

    let mut commits = CommitRange::new(range);
    if let Some(depth) = config.history_depth {
        commits = commits.with_depth(depth);
    }

    let outcome = HistoryIndexer::new(source)
        .update(store.load_last_known(), &commits, inventory.as_ref())
        .await;

    if outcome.degraded {
        if let Some(warning) = &outcome.warning {
            println!("⚠ {}", warning);
        }
        println!("Mapping left unchanged at {}", store.path().display());
        return Ok(());
    }

    store
        .save(&outcome.mapping)
        .with_context(|| format!("Failed to save mapping to {}", store.path().display()))?;

    println!("✓ Mapping updated: {}", store.path().display());
    println!("  Commits indexed: {}", outcome.stats.commits_indexed);
    println!("  Commits already known: {}", outcome.stats.commits_skipped);
    println!("  Associations added: {}", outcome.stats.associations_added);
    if outcome.pruned > 0 {
        println!("  Stale associations pruned: {}", outcome.pruned);
    }
    println!("  Files mapped: {}", outcome.mapping.file_count());
    Ok(())
}

fn cmd_changes(config: &RunConfig, args: &ChangeArgs) -> Result<()> {
    for path in change_set(config, args)?.iter() {
        println!("{}", path);
    }
    Ok(())
}

/// Resolve the selection and write it as JSON
fn cmd_select(config: &RunConfig, args: &ChangeArgs, output: Option<&Path>) -> Result<TestSelection> {
    let selection = resolve(config, args)?;
    let json = serde_json::to_string_pretty(&selection)?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write selection to {}", path.display()))?,
        None => println!("{}", json),
    }
    for path in &selection.fallback_paths {
        warn!(path = %path, "selected by fallback");
    }
    Ok(selection)
}

#[derive(Debug, Clone, Copy)]
enum ShardTarget {
    Shard { index: usize, backend: Backend },
    Job(usize),
}

/// Run one shard and leave its artifacts for `aggregate`
async fn cmd_run_shard(
    config: &RunConfig,
    selection_path: &Path,
    target: ShardTarget,
    mut cancel: CancelToken,
) -> Result<ShardJobOutcome> {
    let content = std::fs::read_to_string(selection_path)
        .with_context(|| format!("Failed to read selection {}", selection_path.display()))?;
    let selection: TestSelection =
        serde_json::from_str(&content).context("Failed to parse selection")?;

    let (index, backend) = match target {
        ShardTarget::Shard { index, backend } => (index, backend),
        ShardTarget::Job(job) => {
            let cell = RunMatrix::new(config.backends(), selection.shard_count())?.cell(job);
            (cell.shard_index, cell.backend)
        }
    };
    let shard = selection.shard(index).with_context(|| {
        format!(
            "shard index {} out of range for {} shards",
            index,
            selection.shard_count()
        )
    })?;

    let pipeline = LocalPipeline::from_config(config, backend)?;
    let artifact_dir = backend_dir(config, backend).join("artifacts");
    let outcome = execute_shard(
        &pipeline.runner(backend),
        &pipeline.comparator(),
        shard,
        selection.shard_count(),
        &artifact_dir,
        &mut cancel,
    )
    .await
    .with_context(|| format!("shard {} on {} failed", index + 1, backend))?;

    match &outcome {
        ShardJobOutcome::Completed { result, report } => {
            println!("Shard {}/{} ({})", index + 1, selection.shard_count(), backend);
            println!("  {}", result.summary_line());
            println!(
                "  New failures: {}, pre-existing: {}",
                report.new_failures.len(),
                report.pre_existing.len()
            );
        }
        ShardJobOutcome::Unavailable { reason } => {
            println!(
                "✗ Shard {}/{} ({}) unavailable: {}",
                index + 1,
                selection.shard_count(),
                backend,
                reason
            );
        }
    }
    Ok(outcome)
}

/// Aggregate every configured backend and apply the gate
fn cmd_aggregate(config: &RunConfig, run_id: Option<&str>) -> Result<()> {
    let run_id = run_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
    let _span = RunSpan::enter(&run_id);

    let mut failed = Vec::new();
    for backend in config.backends() {
        let dir = backend_dir(config, backend);
        let output = aggregate_dir(&dir.join("artifacts"), config.shard_count, &dir, &run_id)
            .with_context(|| format!("Failed to aggregate {}", backend))?;

        print_verdict(backend, &output.report.coverage_line(), &output.verdict);
        println!("  Report: {}", output.paths.markdown.display());
        if !output.verdict.passed {
            failed.push(backend);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("Test gate failed for {}", join_backends(&failed))
    }
}

/// Full local run: select, run every shard per backend, aggregate
async fn cmd_pipeline(config: &RunConfig, args: &ChangeArgs, cancel: CancelToken) -> Result<()> {
    let selection = resolve(config, args)?;
    println!(
        "Selected {} test(s) across {} shard(s)",
        selection.len(),
        selection.shard_count()
    );

    let mut pipelines = Vec::new();
    for backend in config.backends() {
        pipelines.push((backend, LocalPipeline::from_config(config, backend)?));
    }
    let results = run_backends(&pipelines, &selection, &config.artifact_dir, cancel).await?;

    let mut failed = Vec::new();
    for result in &results {
        print_verdict(result.backend, &result.report.coverage_line(), &result.verdict);
        println!("  Run ID: {}", result.run_id);
        println!("  Duration: {}ms", result.duration_ms);
        println!("  Report: {}", result.paths.markdown.display());
        if !result.passed() {
            failed.push(result.backend);
        }
    }

    if failed.is_empty() {
        println!("\n✓ No new failures");
        Ok(())
    } else {
        anyhow::bail!("Test gate failed for {}", join_backends(&failed))
    }
}

fn cmd_matrix(config: &RunConfig) -> Result<()> {
    let matrix = RunMatrix::new(config.backends(), config.shard_count)?;
    let cells: Vec<_> = matrix.cells().collect();
    println!("{}", serde_json::to_string_pretty(&cells)?);
    Ok(())
}

fn print_verdict(backend: Backend, coverage: &str, verdict: &shardgate_core::GateVerdict) {
    let status = if verdict.passed { "✓ PASSED" } else { "✗ FAILED" };
    println!("[{}] Gate: {} ({})", backend, status, coverage);
    println!("  {}", verdict.message);
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
}

fn join_backends(backends: &[Backend]) -> String {
    backends
        .iter()
        .map(Backend::name)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    /// Config rooted in `dir` whose engine fails every test id containing
    /// `broken`.
    fn test_config(dir: &TempDir) -> RunConfig {
        let mut config = RunConfig {
            shard_count: 2,
            mapping_path: dir.path().join("mapping.json"),
            artifact_dir: dir.path().join("out"),
            ..RunConfig::default()
        };
        config.engine.argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"case "$0" in *broken*) echo "boom" >&2; exit 1;; esac; echo "1 passed""#
                .to_string(),
            "{test}".to_string(),
        ];
        config.engine.test_timeout_secs = 30;
        config
    }

    fn save_mapping(config: &RunConfig) {
        let mut mapping = TestMapping::new();
        mapping.associate(
            "src/ops/add.py",
            &[tid("tests/test_ops.py::test_add"), tid("tests/test_ops.py::test_add_broadcast")],
        );
        mapping.associate(
            "src/ops/div.py",
            &[tid("tests/test_ops.py::test_broken_div")],
        );
        MappingStore::new(&config.mapping_path).save(&mapping).unwrap();
    }

    fn explicit(paths: &[&str]) -> ChangeArgs {
        ChangeArgs {
            repo: PathBuf::from("."),
            base: "origin/main".to_string(),
            head: "HEAD".to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_global_overrides_win_over_config() {
        let cli = Cli::try_parse_from([
            "shardgate",
            "--shards",
            "3",
            "--backends",
            "torch,jax",
            "matrix",
        ])
        .unwrap();
        let mut config = RunConfig::default();
        cli.overrides.apply(&mut config);
        assert_eq!(config.shard_count, 3);
        assert_eq!(config.backends(), vec![Backend::Torch, Backend::Jax]);
        assert_eq!(config.backend, Backend::Torch);
    }

    #[test]
    fn test_run_shard_requires_a_target() {
        assert!(Cli::try_parse_from(["shardgate", "run-shard", "-s", "sel.json"]).is_err());
        assert!(Cli::try_parse_from([
            "shardgate",
            "run-shard",
            "-s",
            "sel.json",
            "--job",
            "1",
            "--shard-index",
            "0"
        ])
        .is_err());
    }

    #[test]
    fn test_select_writes_selection_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        save_mapping(&config);
        let out = dir.path().join("selection.json");

        let selection =
            cmd_select(&config, &explicit(&["src/ops/add.py", "README.md"]), Some(&out)).unwrap();
        assert_eq!(selection.len(), 2);
        assert_eq!(selection.shard_count(), 2);

        let written: TestSelection =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written, selection);
    }

    #[test]
    fn test_select_without_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let err = cmd_select(&config, &explicit(&["src/a.py"]), None).unwrap_err();
        assert!(err.to_string().contains("shardgate index"));
    }

    #[tokio::test]
    async fn test_index_from_recorded_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let history = dir.path().join("history.jsonl");
        std::fs::write(
            &history,
            concat!(
                r#"{"sha":"c1","changed_paths":["src/ops/add.py"],"tests_run":["tests/test_ops.py::test_add"]}"#,
                "\n",
                r#"{"sha":"c2","changed_paths":["src/ops/div.py"],"tests_run":["tests/test_ops.py::test_div"]}"#,
                "\n"
            ),
        )
        .unwrap();

        cmd_index(&config, dir.path(), "HEAD", Some(&history), None)
            .await
            .unwrap();
        let mapping = MappingStore::new(&config.mapping_path).load().unwrap();
        assert!(mapping
            .tests_for("src/ops/add.py")
            .unwrap()
            .contains(&tid("tests/test_ops.py::test_add")));
        assert_eq!(mapping.indexed_commit_count(), 2);

        // history gone: the mapping on disk is kept
        std::fs::remove_file(&history).unwrap();
        cmd_index(&config, dir.path(), "HEAD", Some(&history), None)
            .await
            .unwrap();
        assert_eq!(MappingStore::new(&config.mapping_path).load().unwrap(), mapping);
    }

    #[tokio::test]
    async fn test_pipeline_passes_then_reaggregates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        save_mapping(&config);

        cmd_pipeline(&config, &explicit(&["src/ops/add.py"]), CancelToken::never())
            .await
            .unwrap();
        assert!(config.artifact_dir.join("numpy/report.md").exists());

        cmd_aggregate(&config, Some("rerun")).unwrap();
        let json = std::fs::read_to_string(config.artifact_dir.join("numpy/report.json")).unwrap();
        assert!(json.contains("rerun"));
    }

    #[tokio::test]
    async fn test_pipeline_fails_on_new_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        save_mapping(&config);

        let err = cmd_pipeline(&config, &explicit(&["src/ops/div.py"]), CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("numpy"));
        let listed =
            std::fs::read_to_string(config.artifact_dir.join("numpy/new-failures.txt")).unwrap();
        assert_eq!(listed.trim(), "tests/test_ops.py::test_broken_div");
    }

    #[tokio::test]
    async fn test_matrix_jobs_then_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.backends = vec![Backend::Numpy, Backend::Torch];
        save_mapping(&config);
        let selection_path = dir.path().join("selection.json");
        cmd_select(&config, &explicit(&["src/ops/add.py"]), Some(&selection_path)).unwrap();

        // torch jobs (2, 3) only; numpy never reports
        for job in [2, 3] {
            let outcome =
                cmd_run_shard(&config, &selection_path, ShardTarget::Job(job), CancelToken::never())
                    .await
                    .unwrap();
            assert!(matches!(outcome, ShardJobOutcome::Completed { .. }));
        }
        assert!(config
            .artifact_dir
            .join("torch/artifacts/shard-1.results.jsonl")
            .exists());

        let err = cmd_aggregate(&config, None).unwrap_err();
        assert!(err.to_string().contains("numpy"));
        assert!(!err.to_string().contains("torch"));
    }

    #[tokio::test]
    async fn test_run_shard_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        save_mapping(&config);
        let selection_path = dir.path().join("selection.json");
        cmd_select(&config, &explicit(&["src/ops/add.py"]), Some(&selection_path)).unwrap();

        let target = ShardTarget::Shard {
            index: 5,
            backend: Backend::Numpy,
        };
        let err = cmd_run_shard(&config, &selection_path, target, CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
