//! Shard runner: executes one shard's tests through a [`TestEngine`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use shardgate_core::metrics::METRICS;
use shardgate_core::obs::{emit_shard_finished, emit_shard_started};
use shardgate_core::{Backend, Outcome, Shard, ShardResult, TestRecord};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::TestEngine;
use crate::error::{CiError, Result};
use crate::skips::SkipList;

/// Sender half of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiver half of a cancellation signal; cheap to clone per shard.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelToken(rx))
}

/// Executes shards for one backend.
pub struct ShardRunner {
    engine: Arc<dyn TestEngine>,
    backend: Backend,
    skips: SkipList,
    shard_timeout: Option<Duration>,
}

impl ShardRunner {
    pub fn new(engine: Arc<dyn TestEngine>, backend: Backend) -> Self {
        Self {
            engine,
            backend,
            skips: SkipList::default(),
            shard_timeout: None,
        }
    }

    pub fn with_skips(mut self, skips: SkipList) -> Self {
        self.skips = skips;
        self
    }

    /// Bound on the whole shard; `0` disables it.
    pub fn with_shard_timeout(mut self, secs: u64) -> Self {
        self.shard_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Run every test of `shard`, in order.
    ///
    /// An engine error for a single test is recorded as an `error` outcome
    /// and the shard continues.
    ///
    /// Errors:
    /// - a missing engine executable and the shard timeout
    ///   (see [`CiError::is_environment_failure`])
    /// - [`CiError::Cancelled`] when `cancel` fires; nothing is returned for
    ///   the tests already run
    pub async fn run(
        &self,
        shard: &Shard,
        shard_count: usize,
        cancel: &mut CancelToken,
    ) -> Result<ShardResult> {
        let start = Instant::now();
        emit_shard_started(shard.index, shard.len(), self.backend.name());

        let result = match self.shard_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_tests(shard, shard_count, cancel))
                .await
                .map_err(|_| CiError::ShardTimeout {
                    shard: shard.index,
                    secs: limit.as_secs(),
                })??,
            None => self.run_tests(shard, shard_count, cancel).await?,
        };

        let counts = result.counts();
        emit_shard_finished(
            shard.index,
            counts.passed,
            counts.failures(),
            start.elapsed().as_millis() as u64,
        );
        info!("{}", result.summary_line());
        Ok(result)
    }

    async fn run_tests(
        &self,
        shard: &Shard,
        shard_count: usize,
        cancel: &mut CancelToken,
    ) -> Result<ShardResult> {
        let mut result = ShardResult::new(shard.index, shard_count, self.backend);

        for test in &shard.tests {
            if cancel.is_cancelled() {
                return Err(CiError::Cancelled);
            }
            if let Some(prefix) = self.skips.matching(test) {
                debug!(test = %test, prefix = %prefix, "skip list match");
                result.push(
                    TestRecord::new(test.clone(), Outcome::Skipped)
                        .with_diagnostic(format!("skipped by skip list ({prefix})")),
                );
                continue;
            }

            let execution = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CiError::Cancelled),
                execution = self.engine.run_test(test, self.backend) => execution,
            };
            let record = match execution {
                Ok(execution) => execution.into_record(test.clone()),
                // no test can run without the engine
                Err(e @ CiError::EngineNotFound { .. }) => return Err(e),
                Err(e) => {
                    warn!(test = %test, error = %e, "engine error; recording test as error");
                    TestRecord::new(test.clone(), Outcome::Error).with_diagnostic(e.to_string())
                }
            };
            METRICS.inc_tests_executed();
            debug!(test = %test, outcome = %record.outcome, "test finished");
            result.push(record);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedEngine;
    use shardgate_core::TestId;
    use std::collections::BTreeMap;

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    fn shard(tests: &[&str]) -> Shard {
        Shard {
            index: 0,
            tests: tests.iter().map(|t| tid(t)).collect(),
        }
    }

    #[tokio::test]
    async fn records_every_test_in_order() {
        let engine = ScriptedEngine::new(BTreeMap::from([(tid("b"), Outcome::Fail)]));
        let runner = ShardRunner::new(Arc::new(engine), Backend::Torch);
        let result = runner
            .run(&shard(&["a", "b", "c"]), 1, &mut CancelToken::never())
            .await
            .unwrap();

        let outcomes: Vec<_> = result.records.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Pass, Outcome::Fail, Outcome::Pass]);
        assert_eq!(result.backend, Backend::Torch);
    }

    #[tokio::test]
    async fn skip_list_tests_never_reach_the_engine() {
        let engine = Arc::new(ScriptedEngine::new(BTreeMap::new()));
        let runner = ShardRunner::new(engine.clone(), Backend::Numpy)
            .with_skips(SkipList::parse("tests/gpu\n"));
        let result = runner
            .run(
                &shard(&["tests/cpu.py::a", "tests/gpu.py::b"]),
                1,
                &mut CancelToken::never(),
            )
            .await
            .unwrap();

        assert_eq!(engine.calls(), 1);
        assert_eq!(result.records[1].outcome, Outcome::Skipped);
        assert!(result.records[1].diagnostic.as_deref().unwrap().contains("skip list"));
    }

    #[tokio::test]
    async fn missing_engine_fails_the_shard() {
        let runner = ShardRunner::new(Arc::new(ScriptedEngine::missing()), Backend::Numpy);
        let err = runner
            .run(&shard(&["a"]), 1, &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.is_environment_failure());
    }

    #[tokio::test]
    async fn launch_error_only_affects_its_test() {
        let engine = ScriptedEngine::new(BTreeMap::new()).with_spawn_failure(tid("b"));
        let runner = ShardRunner::new(Arc::new(engine), Backend::Numpy);
        let result = runner
            .run(&shard(&["a", "b", "c"]), 1, &mut CancelToken::never())
            .await
            .unwrap();

        let outcomes: Vec<_> = result.records.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Pass, Outcome::Error, Outcome::Pass]);
        assert!(result.records[1].diagnostic.as_deref().unwrap().contains("scripted"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_shard() {
        let engine = ScriptedEngine::new(BTreeMap::new()).with_delay(Duration::from_secs(30));
        let runner = ShardRunner::new(Arc::new(engine), Backend::Numpy);
        let (handle, mut token) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let err = runner.run(&shard(&["a", "b"]), 1, &mut token).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, CiError::Cancelled));
    }

    #[tokio::test]
    async fn shard_timeout_is_environment_failure() {
        let engine = ScriptedEngine::new(BTreeMap::new()).with_delay(Duration::from_secs(30));
        let runner = ShardRunner::new(Arc::new(engine), Backend::Numpy).with_shard_timeout(1);
        let err = runner
            .run(&shard(&["a"]), 1, &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::ShardTimeout { shard: 0, secs: 1 }));
    }
}
