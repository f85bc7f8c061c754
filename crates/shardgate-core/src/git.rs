//! Git integration: change sets from commit ranges and commit history walks.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;

use crate::domain::{ChangeSet, PathFilter, Result, ShardgateError};
use crate::history::{CommitRange, CommitRecord, HistorySource, TestLocator};

/// Separates commits in `git log` output.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Capture the HEAD commit SHA from a git repository.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let stdout = run_git(repo_dir, &["rev-parse", "HEAD"])?;
    let sha = stdout.trim().to_string();
    if sha.is_empty() {
        return Err(ShardgateError::GitError(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Paths changed between the merge base of `base` and `head`
/// (`git diff --name-only base...head`), filtered through `filter`.
pub fn diff_change_set(
    repo_dir: &Path,
    base: &str,
    head: &str,
    filter: &PathFilter,
) -> Result<ChangeSet> {
    let range = format!("{base}...{head}");
    let stdout = run_git(repo_dir, &["diff", "--name-only", "--no-renames", &range])?;
    Ok(ChangeSet::filtered(stdout.lines(), filter))
}

fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| ShardgateError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShardgateError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `git log --format=%x1e%H --name-only` output into commit records,
/// deriving `tests_run` from the changed test files.
pub fn parse_git_log(output: &str, locator: &TestLocator) -> Result<Vec<CommitRecord>> {
    let mut records = Vec::new();
    for chunk in output.split(RECORD_SEPARATOR) {
        let mut lines = chunk.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(sha) = lines.next() else {
            continue;
        };
        if sha.len() < 7 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ShardgateError::History(format!(
                "malformed git log record: expected commit sha, got {sha:?}"
            )));
        }
        let changed_paths: Vec<String> = lines.map(str::to_string).collect();
        let tests_run = changed_paths
            .iter()
            .filter_map(|p| locator.test_id_for(p))
            .collect();
        records.push(CommitRecord {
            sha: sha.to_string(),
            changed_paths,
            tests_run,
        });
    }
    Ok(records)
}

/// Walks `git log` over a commit range.
pub struct GitHistorySource {
    repo_dir: PathBuf,
    locator: TestLocator,
}

impl GitHistorySource {
    pub fn new(repo_dir: impl AsRef<Path>, locator: TestLocator) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
            locator,
        }
    }
}

#[async_trait]
impl HistorySource for GitHistorySource {
    async fn commits(&self, range: &CommitRange) -> Result<Vec<CommitRecord>> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(["log", "--format=%x1e%H", "--name-only", "--no-renames"])
            .current_dir(&self.repo_dir);
        if let Some(max) = range.max_commits {
            cmd.arg(format!("--max-count={max}"));
        }
        cmd.arg(&range.spec);

        let output = cmd
            .output()
            .await
            .map_err(|e| ShardgateError::GitError(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShardgateError::History(format!(
                "git log {} failed: {}",
                range.spec,
                stderr.trim()
            )));
        }

        parse_git_log(&String::from_utf8_lossy(&output.stdout), &self.locator)
    }
}
