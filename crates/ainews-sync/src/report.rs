//! Run report files: one directory per run under the reports root holding
//! `run_summary.json` and a human-readable `daily_brief.md`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ainews_core::ErrorKind;
use tokio::fs;

use crate::{RunStatus, RunSummary};

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "daily_brief.md";

pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(dir.join(BRIEF_FILE), render_daily_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(dir)
}

pub fn render_daily_brief(summary: &RunSummary) -> String {
    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::TimedOut => "timed out",
    };
    let mut lines = vec![
        "# AI News Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {status}"),
        format!(
            "- Articles: {} inserted, {} updated, {} failed",
            summary.articles.inserted, summary.articles.updated, summary.articles.failed
        ),
        format!(
            "- Enrichments: {} written, {} failed",
            summary.enrichments.inserted, summary.enrichments.failed
        ),
    ];
    if summary.duplicates_in_batch > 0 {
        lines.push(format!(
            "- Duplicate urls in batch: {}",
            summary.duplicates_in_batch
        ));
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for stats in &summary.sources {
        let mut line = format!(
            "- {}: {} seen, {} accepted, {} stale, {} skipped",
            stats.source, stats.seen, stats.accepted, stats.stale, stats.skipped
        );
        if stats.image_unresolved > 0 {
            line.push_str(&format!(", {} without image", stats.image_unresolved));
        }
        if let Some(err) = &stats.error {
            line.push_str(&format!(" (unavailable: {err})"));
        } else if !stats.finished {
            line.push_str(" (unfinished)");
        }
        lines.push(line);
    }

    let new_articles: Vec<_> = summary
        .results
        .iter()
        .filter(|r| r.outcome == crate::ArticleOutcome::Inserted)
        .collect();
    if !new_articles.is_empty() {
        lines.push(String::new());
        lines.push("## New Articles".to_string());
        for result in new_articles {
            lines.push(format!("- [{}] {}", result.source, result.url));
        }
    }

    let notable: Vec<_> = summary
        .issues
        .iter()
        .filter(|i| i.kind != ErrorKind::ParseSkip)
        .collect();
    if !notable.is_empty() {
        lines.push(String::new());
        lines.push("## Issues".to_string());
        for issue in notable {
            let subject = issue
                .subject
                .as_deref()
                .map(|s| format!(" `{s}`"))
                .unwrap_or_default();
            lines.push(format!("- {:?}{subject}: {}", issue.kind, issue.detail));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the most recent `runs` run directories, newest first.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(SUMMARY_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut summaries = Vec::new();
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join(SUMMARY_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((dir.path(), summary));
    }
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# AI News Recent Runs".to_string(), String::new()];
    for (dir, summary) in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- status: {:?}", summary.status));
        lines.push(format!(
            "- articles: {} inserted, {} updated, {} failed",
            summary.articles.inserted, summary.articles.updated, summary.articles.failed
        ));
        lines.push(format!("- issues: {}", summary.issues.len()));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
