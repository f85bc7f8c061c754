//! Test-execution engine seam.
//!
//! The runner never interprets a test itself: it hands each identifier to a
//! [`TestEngine`] and records the outcome. [`CommandEngine`] is the
//! process-per-test implementation used in CI.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use shardgate_core::{Backend, Outcome, TestId, TestRecord};
use tokio::process::Command;
use tracing::debug;

use crate::error::{CiError, Result};

/// Lines of engine output kept as a failure diagnostic.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Exit status used by pytest when no tests were collected.
const EXIT_NO_TESTS: i32 = 5;

/// Result of running one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestExecution {
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub diagnostic: Option<String>,
}

impl TestExecution {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            duration_ms: 0,
            diagnostic: None,
        }
    }

    pub fn into_record(self, test: TestId) -> TestRecord {
        let record = TestRecord::new(test, self.outcome).with_duration(self.duration_ms);
        match self.diagnostic {
            Some(d) => record.with_diagnostic(d),
            None => record,
        }
    }
}

/// Runs a single test against a backend.
///
/// `Err` means the execution environment itself is broken (engine missing,
/// cannot spawn). A test that runs and fails, errors or times out is an
/// `Ok` execution with the corresponding outcome.
#[async_trait]
pub trait TestEngine: Send + Sync {
    async fn run_test(&self, test: &TestId, backend: Backend) -> Result<TestExecution>;
}

/// Process-per-test engine driven by an argv template.
///
/// `{test}` and `{backend}` are substituted in every argument.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    argv: Vec<String>,
    test_timeout: Option<Duration>,
    workdir: Option<PathBuf>,
    passed_re: Regex,
    skipped_re: Regex,
}

impl CommandEngine {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.first().map_or(true, |exe| exe.trim().is_empty()) {
            return Err(CiError::EmptyCommand);
        }
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CiError::Config(format!("summary pattern: {e}")))
        };
        Ok(Self {
            argv,
            test_timeout: None,
            workdir: None,
            passed_re: compile(r"\b(\d+) passed\b")?,
            skipped_re: compile(r"\b(\d+) skipped\b")?,
        })
    }

    /// Per-test timeout; `0` disables it.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.test_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    /// Run tests from `dir` (e.g. a baseline worktree).
    pub fn with_workdir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The concrete argv for one test.
    pub fn command_for(&self, test: &TestId, backend: Backend) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{test}", test.as_str())
                    .replace("{backend}", backend.name())
            })
            .collect()
    }

    /// Map an engine exit status (and its summary output) to an outcome.
    ///
    /// `0` pass, `1` fail, `5` nothing collected (skipped), anything else or
    /// death by signal is an error. A zero exit whose summary reports skips
    /// and no passes is a skip.
    pub fn outcome_from_exit(&self, code: Option<i32>, stdout: &str) -> Outcome {
        match code {
            Some(0) if self.only_skipped(stdout) => Outcome::Skipped,
            Some(0) => Outcome::Pass,
            Some(1) => Outcome::Fail,
            Some(EXIT_NO_TESTS) => Outcome::Skipped,
            _ => Outcome::Error,
        }
    }

    fn only_skipped(&self, stdout: &str) -> bool {
        let count = |re: &Regex| -> u64 {
            re.captures_iter(stdout)
                .filter_map(|c| c[1].parse::<u64>().ok())
                .sum()
        };
        count(&self.skipped_re) > 0 && count(&self.passed_re) == 0
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl TestEngine for CommandEngine {
    async fn run_test(&self, test: &TestId, backend: Backend) -> Result<TestExecution> {
        let start = Instant::now();
        let argv = self.command_for(test, backend);
        let (exe, args) = argv.split_first().ok_or(CiError::EmptyCommand)?;

        let mut command = Command::new(exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CiError::EngineNotFound {
                    program: exe.clone(),
                }
            } else {
                CiError::Spawn {
                    test: test.to_string(),
                    source: e,
                }
            }
        })?;

        let output = match self.test_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    debug!(test = %test, "test timed out");
                    return Ok(TestExecution {
                        outcome: Outcome::Error,
                        duration_ms: start.elapsed().as_millis() as u64,
                        diagnostic: Some(format!("timed out after {}s", limit.as_secs())),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = self.outcome_from_exit(output.status.code(), &stdout);
        let diagnostic = outcome.is_failure().then(|| {
            let source = if stderr.trim().is_empty() { &stdout } else { &stderr };
            match output.status.code() {
                Some(code) => format!("exit {code}\n{}", tail(source, DIAGNOSTIC_TAIL_LINES)),
                None => format!("killed by signal\n{}", tail(source, DIAGNOSTIC_TAIL_LINES)),
            }
        });

        Ok(TestExecution {
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            diagnostic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TestId {
        TestId::new(s).unwrap()
    }

    fn sh(script: &str) -> CommandEngine {
        CommandEngine::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[test]
    fn placeholders_are_substituted() {
        let engine = CommandEngine::new(vec![
            "pytest".to_string(),
            "{test}".to_string(),
            "--backend={backend}".to_string(),
        ])
        .unwrap();
        assert_eq!(
            engine.command_for(&tid("tests/test_a.py::t"), Backend::Paddle),
            vec!["pytest", "tests/test_a.py::t", "--backend=paddle"]
        );
    }

    #[test]
    fn exit_code_mapping() {
        let engine = sh("true");
        assert_eq!(engine.outcome_from_exit(Some(0), "1 passed"), Outcome::Pass);
        assert_eq!(engine.outcome_from_exit(Some(0), "1 skipped in 0.1s"), Outcome::Skipped);
        assert_eq!(engine.outcome_from_exit(Some(0), "1 passed, 2 skipped"), Outcome::Pass);
        assert_eq!(engine.outcome_from_exit(Some(1), ""), Outcome::Fail);
        assert_eq!(engine.outcome_from_exit(Some(5), ""), Outcome::Skipped);
        assert_eq!(engine.outcome_from_exit(Some(2), ""), Outcome::Error);
        assert_eq!(engine.outcome_from_exit(None, ""), Outcome::Error);
    }

    #[test]
    fn empty_command_rejected() {
        assert!(matches!(
            CommandEngine::new(vec![]),
            Err(CiError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn runs_process_and_captures_diagnostic() {
        let pass = sh("echo ok").run_test(&tid("t"), Backend::Numpy).await.unwrap();
        assert_eq!(pass.outcome, Outcome::Pass);
        assert!(pass.diagnostic.is_none());

        let fail = sh("echo 'assert x == y' >&2; exit 1")
            .run_test(&tid("t"), Backend::Numpy)
            .await
            .unwrap();
        assert_eq!(fail.outcome, Outcome::Fail);
        assert!(fail.diagnostic.unwrap().contains("assert x == y"));
    }

    #[tokio::test]
    async fn test_id_reaches_the_process() {
        let engine = CommandEngine::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "test \"$0\" = tests/test_a.py::t".to_string(),
            "{test}".to_string(),
        ])
        .unwrap()
        .with_timeout(30);
        let exec = engine.run_test(&tid("tests/test_a.py::t"), Backend::Jax).await.unwrap();
        assert_eq!(exec.outcome, Outcome::Pass);
    }

    #[tokio::test]
    async fn timeout_is_an_error_outcome() {
        let exec = sh("sleep 5")
            .with_timeout(1)
            .run_test(&tid("t"), Backend::Numpy)
            .await
            .unwrap();
        assert_eq!(exec.outcome, Outcome::Error);
        assert!(exec.diagnostic.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_engine_is_environment_failure() {
        let engine = CommandEngine::new(vec!["shardgate-no-such-engine-xyz".to_string()]).unwrap();
        let err = engine.run_test(&tid("t"), Backend::Numpy).await.unwrap_err();
        assert!(matches!(err, CiError::EngineNotFound { .. }));
        assert!(err.is_environment_failure());
    }
}
