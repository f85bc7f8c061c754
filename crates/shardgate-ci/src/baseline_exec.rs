//! Baseline lookup by executing tests on the target-branch checkout.

use std::sync::Arc;

use async_trait::async_trait;
use shardgate_core::metrics::METRICS;
use shardgate_core::{Backend, BaselineLookup, Outcome, ShardgateError, TestId};
use tracing::debug;

use crate::engine::TestEngine;

/// Runs a test once against the baseline revision and reports its outcome.
///
/// The engine is expected to point at a baseline worktree (for
/// [`crate::CommandEngine`], via `with_workdir`). Wrap this in a
/// [`shardgate_core::TieredBaseline`] so each test runs at most once.
pub struct ExecutingBaseline {
    engine: Arc<dyn TestEngine>,
    backend: Backend,
}

impl ExecutingBaseline {
    pub fn new(engine: Arc<dyn TestEngine>, backend: Backend) -> Self {
        Self { engine, backend }
    }
}

#[async_trait]
impl BaselineLookup for ExecutingBaseline {
    async fn lookup(&self, test: &TestId) -> shardgate_core::Result<Option<Outcome>> {
        METRICS.inc_baseline_executions();
        let execution = self
            .engine
            .run_test(test, self.backend)
            .await
            .map_err(|e| ShardgateError::Baseline {
                test: test.to_string(),
                reason: e.to_string(),
            })?;
        debug!(test = %test, outcome = %execution.outcome, "baseline execution");
        Ok(Some(execution.outcome))
    }
}
