//! Final run artifacts: `report.md`, `report.json` and `new-failures.txt`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::write_id_list;
use crate::domain::{CombinedReport, Result, ShardStatus};
use crate::gate::GateVerdict;

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Machine-readable run report written next to `report.md`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReportArtifact {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub verdict: GateVerdict,
    pub report: CombinedReport,
}

/// Paths of everything [`write_report`] produced.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub new_failures: PathBuf,
}

/// Render the combined report as Markdown for PR comments and CI summaries.
pub fn render_report_md(
    report: &CombinedReport,
    verdict: &GateVerdict,
    generated_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let status = if verdict.passed { "PASSED" } else { "FAILED" };
    out.push_str(&format!("# Test Gate: {status}\n\n"));
    out.push_str(&format!("{}\n\n", verdict.message));
    out.push_str(&format!(
        "- {}\n- generated: {}\n\n",
        report.coverage_line(),
        generated_at.to_rfc3339()
    ));

    out.push_str("## Shards\n\n");
    out.push_str("| shard | backend | status | passed | failed | errored | skipped | new | pre-existing |\n");
    out.push_str("|---|---|---|---|---|---|---|---|---|\n");
    for shard in &report.shards {
        let status = match &shard.status {
            ShardStatus::Reported => "reported".to_string(),
            ShardStatus::Unavailable { .. } => "**unavailable**".to_string(),
            ShardStatus::Missing => "**missing**".to_string(),
        };
        let backend = shard
            .backend
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        out.push_str(&format!(
            "| {}/{} | {} | {} | {} | {} | {} | {} | {} | {} |\n",
            shard.shard_index + 1,
            report.expected_shards,
            backend,
            status,
            shard.counts.passed,
            shard.counts.failed,
            shard.counts.errored,
            shard.counts.skipped,
            shard.new_failures,
            shard.pre_existing
        ));
    }
    out.push('\n');

    let t = &report.totals;
    out.push_str("## Totals\n");
    out.push_str(&format!(
        "- passed: {}\n- failed: {}\n- errored: {}\n- skipped: {}\n\n",
        t.passed, t.failed, t.errored, t.skipped
    ));

    let unavailable: Vec<_> = report.unavailable().collect();
    let missing: Vec<_> = report.missing().collect();
    if !unavailable.is_empty() || !missing.is_empty() {
        out.push_str("## Incomplete Shards\n");
        for (index, reason) in unavailable {
            out.push_str(&format!("- shard {} unavailable: {}\n", index + 1, reason));
        }
        for index in missing {
            out.push_str(&format!("- shard {} missing: no artifacts received\n", index + 1));
        }
        out.push('\n');
    }

    out.push_str(&format!("## New Failures ({})\n", report.new_failures.len()));
    if report.new_failures.is_empty() {
        out.push_str("None.\n");
    }
    for f in &report.new_failures {
        let baseline = f
            .failure
            .baseline
            .map_or_else(|| "unknown".to_string(), |b| b.to_string());
        out.push_str(&format!(
            "- `{}` ({}, baseline: {}, shard {})\n",
            f.failure.test,
            f.failure.outcome,
            baseline,
            f.shard_index + 1
        ));
        if let Some(diag) = &f.failure.diagnostic {
            let first = diag.lines().next().unwrap_or_default();
            if !first.is_empty() {
                out.push_str(&format!("  - {}\n", first));
            }
        }
    }
    out.push('\n');

    if !report.pre_existing.is_empty() {
        out.push_str(&format!(
            "## Pre-existing Failures ({})\n",
            report.pre_existing.len()
        ));
        out.push_str("Also failing on the baseline; not gating.\n\n");
        for (index, test) in &report.pre_existing {
            out.push_str(&format!("- `{}` (shard {})\n", test, index + 1));
        }
    }
    out
}

/// Write `report.md`, `report.json` and `new-failures.txt` into `dir`.
pub fn write_report(
    dir: &Path,
    run_id: &str,
    report: &CombinedReport,
    verdict: &GateVerdict,
) -> Result<ReportPaths> {
    std::fs::create_dir_all(dir)?;
    let generated_at = Utc::now();

    let markdown = dir.join("report.md");
    std::fs::write(&markdown, render_report_md(report, verdict, generated_at))?;

    let artifact = RunReportArtifact {
        schema_version: REPORT_SCHEMA_VERSION.to_string(),
        generated_at,
        run_id: run_id.to_string(),
        verdict: verdict.clone(),
        report: report.clone(),
    };
    let json = dir.join("report.json");
    std::fs::write(&json, serde_json::to_string_pretty(&artifact)?)?;

    let new_failures = dir.join("new-failures.txt");
    write_id_list(&new_failures, &report.new_failure_ids())?;

    Ok(ReportPaths {
        markdown,
        json,
        new_failures,
    })
}
