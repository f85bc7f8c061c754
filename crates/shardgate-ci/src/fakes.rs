//! Scripted test engine for exercising runners and pipelines without
//! spawning processes (testing only).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shardgate_core::{Backend, Outcome, TestId};

use crate::engine::{TestEngine, TestExecution};
use crate::error::{CiError, Result};

/// Returns a fixed outcome per test id; unknown ids pass.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    outcomes: BTreeMap<TestId, Outcome>,
    missing: bool,
    spawn_failures: BTreeSet<TestId>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(outcomes: BTreeMap<TestId, Outcome>) -> Self {
        Self {
            outcomes,
            ..Self::default()
        }
    }

    /// An engine whose executable cannot be found.
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::default()
        }
    }

    /// `test` fails to launch; other tests are unaffected.
    pub fn with_spawn_failure(mut self, test: TestId) -> Self {
        self.spawn_failures.insert(test);
        self
    }

    /// Sleep before answering each test.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestEngine for ScriptedEngine {
    async fn run_test(&self, test: &TestId, _backend: Backend) -> Result<TestExecution> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing {
            return Err(CiError::EngineNotFound {
                program: "scripted".to_string(),
            });
        }
        if self.spawn_failures.contains(test) {
            return Err(CiError::Spawn {
                test: test.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "scripted"),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.outcomes.get(test).copied().unwrap_or(Outcome::Pass);
        let mut execution = TestExecution::new(outcome);
        if outcome.is_failure() {
            execution.diagnostic = Some(format!("scripted {outcome}"));
        }
        Ok(execution)
    }
}
