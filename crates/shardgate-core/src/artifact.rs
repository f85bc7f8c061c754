//! Per-shard artifact files exchanged between shard jobs and aggregation.
//!
//! Layout of an artifact directory:
//!
//! ```text
//! shard-<i>.results.jsonl     header, one line per test, footer
//! shard-<i>.new-failures.txt  NEW failing tests: `<id>\tbaseline=<outcome|none>`
//! shard-<i>.unavailable       reason the shard's environment failed
//! ```
//!
//! The footer line is the completion marker: a results file without it is
//! truncated and the shard counts as unavailable. Every file is written to a
//! temp file in the same directory and renamed into place. A shard job
//! clears its index's files before running, so a rerun into the same
//! directory never reports an earlier attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::aggregate::UnavailableShard;
use crate::domain::{
    Backend, NewFailure, NewFailureReport, Outcome, OutcomeCounts, Result, ShardResult,
    ShardgateError, TestId, TestRecord,
};

const BASELINE_FIELD: &str = "\tbaseline=";

/// One line of a `shard-<i>.results.jsonl` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultLine {
    Header {
        shard_index: usize,
        shard_count: usize,
        backend: Backend,
        started_at: DateTime<Utc>,
    },
    Test(TestRecord),
    Footer {
        counts: OutcomeCounts,
        finished_at: DateTime<Utc>,
    },
}

pub fn results_path(dir: &Path, shard_index: usize) -> PathBuf {
    dir.join(format!("shard-{shard_index}.results.jsonl"))
}

pub fn new_failures_path(dir: &Path, shard_index: usize) -> PathBuf {
    dir.join(format!("shard-{shard_index}.new-failures.txt"))
}

pub fn unavailable_path(dir: &Path, shard_index: usize) -> PathBuf {
    dir.join(format!("shard-{shard_index}.unavailable"))
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn shard_file_pattern() -> Result<Regex> {
    Regex::new(r"^shard-(\d+)\.(results\.jsonl|new-failures\.txt|unavailable)$")
        .map_err(|e| ShardgateError::Artifact {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove every artifact of shard `shard_index` from `dir`.
pub fn clear_shard_artifacts(dir: &Path, shard_index: usize) -> Result<()> {
    for path in [
        results_path(dir, shard_index),
        new_failures_path(dir, shard_index),
        unavailable_path(dir, shard_index),
    ] {
        if remove_if_present(&path)? {
            debug!(path = %path.display(), "removed stale artifact");
        }
    }
    Ok(())
}

/// Remove every shard artifact from `dir`, whatever its index. Other files
/// are left alone. Returns the number of files removed.
pub fn clear_artifact_dir(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let pattern = shard_file_pattern()?;
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_artifact = entry
            .file_name()
            .to_str()
            .is_some_and(|n| pattern.is_match(n));
        if is_artifact && remove_if_present(&entry.path())? {
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "cleared stale artifacts");
    }
    Ok(removed)
}

fn artifact_error(path: &Path, reason: impl Into<String>) -> ShardgateError {
    ShardgateError::Artifact {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Write `result` as `shard-<i>.results.jsonl` under `dir`.
pub fn write_shard_results(
    dir: &Path,
    result: &ShardResult,
    started_at: DateTime<Utc>,
) -> Result<PathBuf> {
    let mut out = Vec::new();
    let header = ResultLine::Header {
        shard_index: result.shard_index,
        shard_count: result.shard_count,
        backend: result.backend,
        started_at,
    };
    serde_json::to_writer(&mut out, &header)?;
    out.push(b'\n');
    for record in &result.records {
        serde_json::to_writer(&mut out, &ResultLine::Test(record.clone()))?;
        out.push(b'\n');
    }
    let footer = ResultLine::Footer {
        counts: result.counts(),
        finished_at: Utc::now(),
    };
    serde_json::to_writer(&mut out, &footer)?;
    out.push(b'\n');

    let path = results_path(dir, result.shard_index);
    write_atomic(&path, &out)?;
    debug!(path = %path.display(), records = result.records.len(), "wrote shard results");
    Ok(path)
}

/// Parse a results file.
///
/// Fails with [`ShardgateError::TruncatedArtifact`] when the footer is
/// missing (including a cut-off final line) and with
/// [`ShardgateError::Artifact`] for any other malformation.
pub fn read_shard_results(path: &Path) -> Result<ShardResult> {
    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut result: Option<ShardResult> = None;
    let mut footer: Option<OutcomeCounts> = None;

    for (n, line) in lines.iter().enumerate() {
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(_) if n + 1 == lines.len() => {
                return Err(ShardgateError::TruncatedArtifact(path.to_path_buf()))
            }
            Err(e) => return Err(artifact_error(path, format!("line {}: {e}", n + 1))),
        };
        if footer.is_some() {
            return Err(artifact_error(path, "content after footer"));
        }
        if result.is_none() && !matches!(parsed, ResultLine::Header { .. }) {
            return Err(artifact_error(path, "first line is not a header"));
        }
        match parsed {
            ResultLine::Header {
                shard_index,
                shard_count,
                backend,
                ..
            } => {
                if result.is_some() {
                    return Err(artifact_error(path, "duplicate header"));
                }
                result = Some(ShardResult::new(shard_index, shard_count, backend));
            }
            ResultLine::Test(record) => {
                if let Some(result) = result.as_mut() {
                    result.push(record);
                }
            }
            ResultLine::Footer { counts, .. } => footer = Some(counts),
        }
    }

    let result = result.ok_or_else(|| ShardgateError::TruncatedArtifact(path.to_path_buf()))?;
    let counts = footer.ok_or_else(|| ShardgateError::TruncatedArtifact(path.to_path_buf()))?;
    if counts != result.counts() {
        return Err(artifact_error(path, "footer totals do not match records"));
    }
    Ok(result)
}

/// Write the NEW failures of `report` as `shard-<i>.new-failures.txt`, each
/// id annotated with the baseline outcome it was classified against.
pub fn write_new_failures(dir: &Path, report: &NewFailureReport) -> Result<PathBuf> {
    let mut out = String::new();
    for failure in &report.new_failures {
        let baseline = failure.baseline.map_or("none", |b| b.as_str());
        out.push_str(&format!("{}{BASELINE_FIELD}{baseline}\n", failure.test.as_str()));
    }
    let path = new_failures_path(dir, report.shard_index);
    write_atomic(&path, out.as_bytes())?;
    Ok(path)
}

/// Read a test id list (new-failures files, test inventories). Blank lines
/// and `#` comments are ignored.
pub fn read_id_list(path: &Path) -> Result<Vec<TestId>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| TestId::new(l).map_err(|e| artifact_error(path, e.to_string())))
        .collect()
}

/// Read a shard's new-failures file. Lines without a baseline annotation
/// (plain id lists) read as having no baseline record.
pub fn read_new_failures(path: &Path) -> Result<Vec<(TestId, Option<Outcome>)>> {
    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (id, baseline) = match line.rsplit_once(BASELINE_FIELD) {
            Some((id, "none")) => (id, None),
            Some((id, outcome)) => {
                let outcome = outcome
                    .trim()
                    .parse::<Outcome>()
                    .map_err(|e| artifact_error(path, e.to_string()))?;
                (id, Some(outcome))
            }
            None => (line, None),
        };
        let id = TestId::new(id).map_err(|e| artifact_error(path, e.to_string()))?;
        entries.push((id, baseline));
    }
    Ok(entries)
}

/// Write a plain test id list (used for the combined `new-failures.txt`).
pub fn write_id_list(path: &Path, ids: &[TestId]) -> Result<()> {
    let mut out = String::new();
    for id in ids {
        out.push_str(id.as_str());
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

/// Mark a shard as unavailable. Replaces any results it may have written.
pub fn write_unavailable(dir: &Path, shard_index: usize, reason: &str) -> Result<PathBuf> {
    let path = unavailable_path(dir, shard_index);
    write_atomic(&path, reason.as_bytes())?;
    Ok(path)
}

/// Rebuild the shard's report from its new-failures entries and its results.
///
/// Failing records not listed as new are pre-existing.
fn rejoin_report(
    path: &Path,
    result: &ShardResult,
    entries: &[(TestId, Option<Outcome>)],
) -> Result<NewFailureReport> {
    let listed: BTreeMap<&TestId, Option<Outcome>> =
        entries.iter().map(|(id, baseline)| (id, *baseline)).collect();
    let mut report = NewFailureReport::empty(result.shard_index);
    for (id, baseline) in &listed {
        let record = result
            .record_for(id)
            .filter(|r| r.outcome.is_failure())
            .ok_or_else(|| artifact_error(path, format!("{id} is not a failing test of the shard")))?;
        report.new_failures.push(NewFailure {
            test: record.test.clone(),
            outcome: record.outcome,
            baseline: *baseline,
            diagnostic: record.diagnostic.clone(),
        });
    }
    let pre_existing: BTreeSet<TestId> = result
        .failures()
        .filter(|r| !listed.contains_key(&r.test))
        .map(|r| r.test.clone())
        .collect();
    report.pre_existing = pre_existing.into_iter().collect();
    Ok(report)
}

/// Everything collected from an artifact directory, ready for the aggregator.
#[derive(Debug, Default)]
pub struct ShardInputs {
    pub results: Vec<ShardResult>,
    pub reports: Vec<NewFailureReport>,
    pub unavailable: Vec<UnavailableShard>,
}

/// Collect the artifacts of `expected` shards from `dir`.
///
/// Per-shard problems (truncated or malformed files) become unavailable
/// shards; shards with no files at all are left out and surface as missing.
/// Artifacts for an index outside `0..expected` are an error.
pub fn collect_shard_inputs(dir: &Path, expected: usize) -> Result<ShardInputs> {
    check_index_range(dir, expected)?;
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "artifact directory does not exist");
    }

    let mut inputs = ShardInputs::default();
    for index in 0..expected {
        let marker = unavailable_path(dir, index);
        if marker.exists() {
            let reason = fs::read_to_string(&marker)?.trim().to_string();
            let reason = if reason.is_empty() {
                "shard execution failed".to_string()
            } else {
                reason
            };
            inputs.unavailable.push(UnavailableShard::new(index, reason));
            continue;
        }

        let results_file = results_path(dir, index);
        let failures_file = new_failures_path(dir, index);
        match (results_file.exists(), failures_file.exists()) {
            (false, false) => {
                debug!(shard = index, "no artifacts");
            }
            (false, true) => {
                inputs
                    .unavailable
                    .push(UnavailableShard::new(index, "shard results missing"));
            }
            (true, has_failures) => match read_shard_results(&results_file) {
                Err(e) => {
                    warn!(shard = index, error = %e, "unreadable shard results");
                    inputs.unavailable.push(UnavailableShard::new(index, e.to_string()));
                }
                Ok(result) if result.shard_index != index => {
                    inputs.unavailable.push(UnavailableShard::new(
                        index,
                        format!("results file declares shard {}", result.shard_index),
                    ));
                }
                Ok(result) if !has_failures => inputs.results.push(result),
                Ok(result) => {
                    let report = read_new_failures(&failures_file)
                        .and_then(|entries| rejoin_report(&failures_file, &result, &entries));
                    match report {
                        Ok(report) => {
                            inputs.results.push(result);
                            inputs.reports.push(report);
                        }
                        Err(e) => {
                            warn!(shard = index, error = %e, "unreadable new-failures file");
                            inputs.unavailable.push(UnavailableShard::new(index, e.to_string()));
                        }
                    }
                }
            },
        }
    }
    Ok(inputs)
}

fn check_index_range(dir: &Path, expected: usize) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let pattern = shard_file_pattern()?;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(caps) = name.to_str().and_then(|n| pattern.captures(n)) else {
            continue;
        };
        let index: usize = caps[1]
            .parse()
            .map_err(|_| artifact_error(dir, format!("bad shard index in {:?}", name)))?;
        if index >= expected {
            return Err(ShardgateError::ShardOutOfRange { index, expected });
        }
    }
    Ok(())
}
