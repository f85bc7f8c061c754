//! Baseline comparator: separates new failures from pre-existing ones.
//!
//! The target-branch state is an injected [`BaselineLookup`], never ambient
//! environment, so tests substitute fixtures for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::{
    Backend, FailureClass, NewFailure, NewFailureReport, Outcome, Result, ShardResult, ShardgateError,
    TestId,
};
use crate::obs::emit_baseline_classified;

/// Classify one PR outcome against its baseline outcome.
///
/// Returns `None` for non-failures. Baseline `fail`/`error` means
/// pre-existing; `pass`, `skipped` or no record at all means new.
pub fn classify_failure(outcome: Outcome, baseline: Option<Outcome>) -> Option<FailureClass> {
    if !outcome.is_failure() {
        return None;
    }
    match baseline {
        Some(b) if b.is_failure() => Some(FailureClass::PreExisting),
        _ => Some(FailureClass::New),
    }
}

/// Outcome of a test on the baseline revision.
#[async_trait]
pub trait BaselineLookup: Send + Sync {
    /// `Ok(None)` when the baseline has no record of the test.
    async fn lookup(&self, test: &TestId) -> Result<Option<Outcome>>;
}

/// Baseline outcomes recorded by a previous target-branch run.
#[derive(Debug, Clone, Default)]
pub struct RecordedBaseline {
    outcomes: BTreeMap<TestId, Outcome>,
}

impl RecordedBaseline {
    pub fn new(outcomes: BTreeMap<TestId, Outcome>) -> Self {
        Self { outcomes }
    }

    /// Collect `backend`'s outcomes from target-branch shard results; results
    /// recorded on other backends are ignored. When a test shows up more than
    /// once, a failure wins.
    pub fn from_results<'a, I>(results: I, backend: Backend) -> Self
    where
        I: IntoIterator<Item = &'a ShardResult>,
    {
        let mut outcomes = BTreeMap::new();
        for result in results {
            if result.backend != backend {
                debug!(
                    shard = result.shard_index,
                    recorded = %result.backend,
                    wanted = %backend,
                    "ignoring baseline results of another backend"
                );
                continue;
            }
            for record in &result.records {
                outcomes
                    .entry(record.test.clone())
                    .and_modify(|o: &mut Outcome| {
                        if record.outcome.is_failure() {
                            *o = record.outcome;
                        }
                    })
                    .or_insert(record.outcome);
            }
        }
        Self { outcomes }
    }

    pub fn get(&self, test: &TestId) -> Option<Outcome> {
        self.outcomes.get(test).copied()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[async_trait]
impl BaselineLookup for RecordedBaseline {
    async fn lookup(&self, test: &TestId) -> Result<Option<Outcome>> {
        Ok(self.get(test))
    }
}

type Memo = std::result::Result<Option<Outcome>, String>;

/// Recorded outcomes first; the executor only for tests the record lacks.
///
/// Executor answers (errors included) are memoised per test id, so each
/// distinct test is executed on the baseline at most once per process even
/// when several shards ask concurrently.
pub struct TieredBaseline {
    recorded: RecordedBaseline,
    executor: Arc<dyn BaselineLookup>,
    memo: Mutex<HashMap<TestId, Arc<OnceCell<Memo>>>>,
}

impl TieredBaseline {
    pub fn new(recorded: RecordedBaseline, executor: Arc<dyn BaselineLookup>) -> Self {
        Self {
            recorded,
            executor,
            memo: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BaselineLookup for TieredBaseline {
    async fn lookup(&self, test: &TestId) -> Result<Option<Outcome>> {
        if let Some(outcome) = self.recorded.get(test) {
            return Ok(Some(outcome));
        }

        let cell = {
            let mut memo = self.memo.lock().await;
            Arc::clone(memo.entry(test.clone()).or_default())
        };
        let memo = cell
            .get_or_init(|| async {
                debug!(test = %test, "baseline cache miss; executing on baseline");
                self.executor.lookup(test).await.map_err(|e| e.to_string())
            })
            .await;

        memo.clone().map_err(|reason| ShardgateError::Baseline {
            test: test.to_string(),
            reason,
        })
    }
}

/// Classifies a shard's failures against the baseline.
pub struct BaselineComparator {
    lookup: Arc<dyn BaselineLookup>,
    max_concurrency: usize,
}

impl BaselineComparator {
    pub const DEFAULT_CONCURRENCY: usize = 4;

    pub fn new(lookup: Arc<dyn BaselineLookup>) -> Self {
        Self {
            lookup,
            max_concurrency: Self::DEFAULT_CONCURRENCY,
        }
    }

    /// Bound on concurrent baseline lookups (at least 1).
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Build the shard's [`NewFailureReport`].
    ///
    /// Each distinct failing test is looked up exactly once; lookups run in
    /// parallel up to the concurrency bound. A failed lookup counts as
    /// "no baseline record" and so classifies the failure as new.
    pub async fn classify(&self, result: &ShardResult) -> NewFailureReport {
        let mut distinct: Vec<TestId> = result.failures().map(|r| r.test.clone()).collect();
        distinct.sort();
        distinct.dedup();

        let baselines = self.lookup_all(distinct).await;

        let mut report = NewFailureReport::empty(result.shard_index);
        let mut seen = std::collections::BTreeSet::new();
        for record in result.failures() {
            if !seen.insert(&record.test) {
                continue;
            }
            let baseline = baselines.get(&record.test).copied().flatten();
            match classify_failure(record.outcome, baseline) {
                Some(FailureClass::New) => report.new_failures.push(NewFailure {
                    test: record.test.clone(),
                    outcome: record.outcome,
                    baseline,
                    diagnostic: record.diagnostic.clone(),
                }),
                Some(FailureClass::PreExisting) => report.pre_existing.push(record.test.clone()),
                None => {}
            }
        }
        report.new_failures.sort();
        report.pre_existing.sort();

        emit_baseline_classified(
            result.shard_index,
            report.new_failures.len(),
            report.pre_existing.len(),
        );
        report
    }

    async fn lookup_all(&self, tests: Vec<TestId>) -> HashMap<TestId, Option<Outcome>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        for test in tests {
            let lookup = Arc::clone(&self.lookup);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => lookup.lookup(&test).await,
                    Err(e) => Err(ShardgateError::Baseline {
                        test: test.to_string(),
                        reason: e.to_string(),
                    }),
                };
                (test, outcome)
            });
        }

        let mut baselines = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((test, Ok(outcome))) => {
                    baselines.insert(test, outcome);
                }
                Ok((test, Err(e))) => {
                    warn!(test = %test, error = %e, "baseline lookup failed; treating as absent");
                    baselines.insert(test, None);
                }
                Err(e) => warn!(error = %e, "baseline lookup task failed"),
            }
        }
        baselines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Backend, TestRecord};
    use crate::fakes::CountingBaseline;

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    fn shard(records: &[(&str, Outcome)]) -> ShardResult {
        let mut result = ShardResult::new(0, 1, Backend::Numpy);
        for (name, outcome) in records {
            result.push(TestRecord::new(tid(name), *outcome));
        }
        result
    }

    #[test]
    fn classification_truth_table() {
        use Outcome::*;
        assert_eq!(classify_failure(Pass, None), None);
        assert_eq!(classify_failure(Skipped, Some(Fail)), None);
        assert_eq!(classify_failure(Fail, Some(Pass)), Some(FailureClass::New));
        assert_eq!(classify_failure(Fail, None), Some(FailureClass::New));
        assert_eq!(classify_failure(Error, Some(Skipped)), Some(FailureClass::New));
        assert_eq!(classify_failure(Fail, Some(Fail)), Some(FailureClass::PreExisting));
        assert_eq!(classify_failure(Error, Some(Error)), Some(FailureClass::PreExisting));
        assert_eq!(classify_failure(Fail, Some(Error)), Some(FailureClass::PreExisting));
    }

    #[tokio::test]
    async fn only_b_is_new() {
        let result = shard(&[("A", Outcome::Fail), ("B", Outcome::Fail), ("C", Outcome::Pass)]);
        let baseline = RecordedBaseline::new(
            [(tid("A"), Outcome::Fail), (tid("B"), Outcome::Pass)]
                .into_iter()
                .collect(),
        );
        let report = BaselineComparator::new(Arc::new(baseline))
            .classify(&result)
            .await;

        assert_eq!(report.new_failure_ids(), vec![tid("B")]);
        assert_eq!(report.pre_existing, vec![tid("A")]);
    }

    #[tokio::test]
    async fn unknown_baseline_is_new() {
        let result = shard(&[("D", Outcome::Fail)]);
        let report = BaselineComparator::new(Arc::new(RecordedBaseline::default()))
            .classify(&result)
            .await;
        assert_eq!(report.new_failure_ids(), vec![tid("D")]);
        assert_eq!(report.new_failures[0].baseline, None);
    }

    #[tokio::test]
    async fn lookup_failure_is_treated_as_absent() {
        let result = shard(&[("E", Outcome::Error)]);
        let lookup = CountingBaseline::failing("baseline checkout missing");
        let report = BaselineComparator::new(Arc::new(lookup)).classify(&result).await;
        assert_eq!(report.new_failure_ids(), vec![tid("E")]);
    }

    #[tokio::test]
    async fn duplicate_failures_trigger_one_lookup() {
        let result = shard(&[
            ("X", Outcome::Fail),
            ("X", Outcome::Fail),
            ("Y", Outcome::Error),
            ("Z", Outcome::Pass),
        ]);
        let lookup = Arc::new(CountingBaseline::new(
            [(tid("Y"), Outcome::Error)].into_iter().collect(),
        ));
        let report = BaselineComparator::new(lookup.clone())
            .with_concurrency(1)
            .classify(&result)
            .await;

        assert_eq!(lookup.calls(), 2);
        assert_eq!(report.new_failure_ids(), vec![tid("X")]);
        assert_eq!(report.pre_existing, vec![tid("Y")]);
    }

    #[tokio::test]
    async fn tiered_prefers_recorded_and_memoises_executor() {
        let executor = Arc::new(CountingBaseline::new(
            [(tid("fresh"), Outcome::Pass)].into_iter().collect(),
        ));
        let recorded = RecordedBaseline::new([(tid("cached"), Outcome::Fail)].into_iter().collect());
        let tiered = TieredBaseline::new(recorded, executor.clone());

        assert_eq!(tiered.lookup(&tid("cached")).await.unwrap(), Some(Outcome::Fail));
        assert_eq!(executor.calls(), 0);

        assert_eq!(tiered.lookup(&tid("fresh")).await.unwrap(), Some(Outcome::Pass));
        assert_eq!(tiered.lookup(&tid("fresh")).await.unwrap(), Some(Outcome::Pass));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn tiered_memoises_executor_errors() {
        let executor = Arc::new(CountingBaseline::failing("engine down"));
        let tiered = TieredBaseline::new(RecordedBaseline::default(), executor.clone());
        assert!(tiered.lookup(&tid("t")).await.is_err());
        assert!(tiered.lookup(&tid("t")).await.is_err());
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn recorded_from_results_prefers_failures() {
        let mut a = ShardResult::new(0, 2, Backend::Torch);
        a.push(TestRecord::new(tid("t"), Outcome::Pass));
        let mut b = ShardResult::new(1, 2, Backend::Torch);
        b.push(TestRecord::new(tid("t"), Outcome::Fail));
        let recorded = RecordedBaseline::from_results([&a, &b], Backend::Torch);
        assert_eq!(recorded.get(&tid("t")), Some(Outcome::Fail));
        assert_eq!(recorded.len(), 1);
    }

    #[tokio::test]
    async fn recorded_outcomes_stay_with_their_backend() {
        let mut numpy = ShardResult::new(0, 1, Backend::Numpy);
        numpy.push(TestRecord::new(tid("x"), Outcome::Fail));
        let recorded = RecordedBaseline::from_results([&numpy], Backend::Torch);
        assert!(recorded.is_empty());

        let mut pr = ShardResult::new(0, 1, Backend::Torch);
        pr.push(TestRecord::new(tid("x"), Outcome::Fail));
        let report = BaselineComparator::new(Arc::new(recorded))
            .classify(&pr)
            .await;
        assert_eq!(report.new_failure_ids(), vec![tid("x")]);
        assert!(report.pre_existing.is_empty());
    }
}
