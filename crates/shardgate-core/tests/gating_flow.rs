//! End-to-end flow over the core library: index → select → classify →
//! artifacts → aggregate → gate → report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use shardgate_core::artifact::{write_new_failures, write_unavailable};
use shardgate_core::fakes::{CountingBaseline, MemoryHistorySource};
use shardgate_core::{
    collect_shard_inputs, evaluate_gate, write_report, write_shard_results, Aggregator, Backend,
    BaselineComparator, ChangeSet, CommitRange, CommitRecord, HistoryIndexer, ImpactResolver,
    MappingStore, Outcome, RecordedBaseline, ShardResult, TestId, TestRecord, TieredBaseline,
};

fn tid(s: &str) -> TestId {
    TestId::new(s).unwrap()
}

fn commit(sha: &str, paths: &[&str], tests: &[&str]) -> CommitRecord {
    CommitRecord {
        sha: sha.to_string(),
        changed_paths: paths.iter().map(|p| p.to_string()).collect(),
        tests_run: tests.iter().map(|t| tid(t)).collect(),
    }
}

fn run_shard(
    index: usize,
    count: usize,
    tests: &[TestId],
    outcomes: &BTreeMap<TestId, Outcome>,
) -> ShardResult {
    let mut result = ShardResult::new(index, count, Backend::Torch);
    for test in tests {
        let outcome = outcomes.get(test).copied().unwrap_or(Outcome::Pass);
        result.push(TestRecord::new(test.clone(), outcome));
    }
    result
}

#[tokio::test]
async fn classification_example_from_recorded_baseline() {
    // PR: A fail, B fail, C pass; baseline: A fail, B pass
    let mut shard = ShardResult::new(0, 1, Backend::Numpy);
    shard.push(TestRecord::new(tid("A"), Outcome::Fail));
    shard.push(TestRecord::new(tid("B"), Outcome::Fail));
    shard.push(TestRecord::new(tid("C"), Outcome::Pass));
    shard.push(TestRecord::new(tid("D"), Outcome::Fail));

    let baseline = RecordedBaseline::new(BTreeMap::from([
        (tid("A"), Outcome::Fail),
        (tid("B"), Outcome::Pass),
    ]));
    let report = BaselineComparator::new(Arc::new(baseline))
        .classify(&shard)
        .await;

    // D has no baseline record and is new as well
    assert_eq!(report.new_failure_ids(), vec![tid("B"), tid("D")]);
    assert_eq!(report.pre_existing, vec![tid("A")]);
}

#[tokio::test]
async fn tiered_baseline_executes_each_miss_once_across_shards() {
    let executor = Arc::new(CountingBaseline::new(BTreeMap::from([(
        tid("flaky"),
        Outcome::Fail,
    )])));
    let recorded = RecordedBaseline::new(BTreeMap::from([(tid("known"), Outcome::Pass)]));
    let tiered = Arc::new(TieredBaseline::new(recorded, executor.clone()));
    let comparator = BaselineComparator::new(tiered).with_concurrency(2);

    let mut s0 = ShardResult::new(0, 2, Backend::Jax);
    s0.push(TestRecord::new(tid("known"), Outcome::Fail));
    s0.push(TestRecord::new(tid("flaky"), Outcome::Fail));
    let mut s1 = ShardResult::new(1, 2, Backend::Jax);
    s1.push(TestRecord::new(tid("flaky"), Outcome::Error));

    let (r0, r1) = tokio::join!(comparator.classify(&s0), comparator.classify(&s1));
    assert_eq!(r0.new_failure_ids(), vec![tid("known")]);
    assert_eq!(r0.pre_existing, vec![tid("flaky")]);
    assert_eq!(r1.pre_existing, vec![tid("flaky")]);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn full_run_with_one_unavailable_shard() {
    let dir = tempfile::tempdir().unwrap();
    let store = MappingStore::new(dir.path().join("mapping.json"));

    let history = MemoryHistorySource::new(vec![
        commit("c1", &["pkg/core/add.py"], &["tests/test_add.py::t1", "tests/test_add.py::t2"]),
        commit("c2", &["pkg/core/mul.py"], &["tests/test_mul.py::t1"]),
        commit("c3", &["pkg/nn/conv.py"], &["tests/test_conv.py::t1", "tests/test_conv.py::t2"]),
    ]);
    let indexer = HistoryIndexer::new(Arc::new(history));
    let outcome = indexer
        .update(store.load_last_known(), &CommitRange::new("main"), None)
        .await;
    assert!(!outcome.degraded);
    store.save(&outcome.mapping).unwrap();

    // Re-indexing the same history changes nothing.
    let again = indexer
        .update(store.load_last_known(), &CommitRange::new("main"), None)
        .await;
    assert_eq!(again.mapping, outcome.mapping);
    assert_eq!(again.stats.commits_indexed, 0);

    let changes = ChangeSet::new(["pkg/core/add.py", "pkg/nn/conv.py", "pkg/core/mul.py"]);
    let selection = ImpactResolver::default()
        .resolve(&changes, &store.load().unwrap(), 4)
        .unwrap();
    assert_eq!(selection.len(), 5);

    let pr_outcomes = BTreeMap::from([
        (tid("tests/test_add.py::t2"), Outcome::Fail),
        (tid("tests/test_conv.py::t1"), Outcome::Fail),
    ]);
    let baseline = Arc::new(RecordedBaseline::new(BTreeMap::from([(
        tid("tests/test_conv.py::t1"),
        Outcome::Fail,
    )])));
    let comparator = BaselineComparator::new(baseline);

    let artifacts = dir.path().join("artifacts");
    for shard in &selection.shards {
        if shard.index == 1 {
            write_unavailable(&artifacts, 1, "runner crashed").unwrap();
            continue;
        }
        let result = run_shard(shard.index, 4, &shard.tests, &pr_outcomes);
        let report = comparator.classify(&result).await;
        write_shard_results(&artifacts, &result, Utc::now()).unwrap();
        write_new_failures(&artifacts, &report).unwrap();
    }

    let inputs = collect_shard_inputs(&artifacts, 4).unwrap();
    let combined = Aggregator::new(4)
        .unwrap()
        .aggregate(&inputs.results, &inputs.reports, &inputs.unavailable)
        .unwrap();
    assert_eq!(combined.coverage_line(), "3 of 4 shards reported");

    let verdict = evaluate_gate(&combined);
    assert!(!verdict.passed);

    let paths = write_report(dir.path(), "run-e2e", &combined, &verdict).unwrap();
    let md = std::fs::read_to_string(paths.markdown).unwrap();
    assert!(md.contains("3 of 4 shards reported"));
    assert!(md.contains("shard 2 unavailable: runner crashed"));
}

#[tokio::test]
async fn empty_change_set_passes_the_gate() {
    let selection = ImpactResolver::default()
        .resolve(&ChangeSet::default(), &Default::default(), 3)
        .unwrap();
    let comparator = BaselineComparator::new(Arc::new(RecordedBaseline::default()));

    let mut results = Vec::new();
    let mut reports = Vec::new();
    for shard in &selection.shards {
        let result = ShardResult::new(shard.index, 3, Backend::Numpy);
        reports.push(comparator.classify(&result).await);
        results.push(result);
    }
    let combined = Aggregator::new(3)
        .unwrap()
        .aggregate(&results, &reports, &[])
        .unwrap();
    let verdict = evaluate_gate(&combined);
    assert!(verdict.passed);
    assert_eq!(combined.totals.total(), 0);
}
