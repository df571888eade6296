//! Rendering of timelines and reports for the terminal.

use std::fmt::Write as _;

use bugtrail_core_types::{KeyIssueKind, Summary, Timeline};
use chrono::{DateTime, SecondsFormat};
use clap::ValueEnum;
use serde::Serialize;
use session_recorder::SessionReport;

use crate::errors::BugtrailResult;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Yaml,
}

/// Serializes `value` in a machine format, or falls back to `human` for the human one.
pub fn render<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(&T) -> String,
) -> BugtrailResult<String> {
    Ok(match format {
        OutputFormat::Human => human(value),
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    })
}

pub fn report_human(report: &SessionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Session {} on tab {}{}",
        report.session,
        report.tab,
        if report.aborted { " (tab closed)" } else { "" }
    );
    let _ = writeln!(
        out,
        "Recorded {} for {} ms",
        wall_clock(report.started_at_ms),
        report.stopped_at_ms.saturating_sub(report.started_at_ms)
    );
    if let Some(network) = &report.network {
        let _ = writeln!(
            out,
            "Network: {} requests, {} failed, {} still pending",
            network.requests, network.failed, network.pending
        );
    }
    out.push_str(&timeline_human(&report.timeline));
    out
}

pub fn timeline_human(timeline: &Timeline) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Summary: {}", summary_line(&timeline.summary));

    if timeline.key_issues.is_empty() {
        out.push_str("Key issues: none\n");
    } else {
        out.push_str("Key issues:\n");
        for issue in &timeline.key_issues {
            let _ = writeln!(
                out,
                "  {} +{}ms {:<16} {}",
                if issue.is_root_cause { "*" } else { " " },
                issue.relative_ms,
                issue_label(issue.kind),
                issue.description
            );
        }
    }

    out.push_str("Events:\n");
    for event in &timeline.events {
        let _ = writeln!(
            out,
            "  +{:<8} {:<17} {}",
            format!("{}ms", event.relative_ms),
            event.kind.as_str(),
            event.message
        );
    }
    out
}

fn summary_line(summary: &Summary) -> String {
    format!(
        "{} interactions, {} requests ({} failed), {} console errors, {} warnings, {} logs, {} backend logs, {} backend errors",
        summary.interactions,
        summary.network_requests,
        summary.network_failures,
        summary.console_errors,
        summary.console_warnings,
        summary.console_logs,
        summary.backend_logs,
        summary.backend_errors
    )
}

fn issue_label(kind: KeyIssueKind) -> &'static str {
    match kind {
        KeyIssueKind::ConsoleError => "console-error",
        KeyIssueKind::NetworkFailure => "network-failure",
        KeyIssueKind::BackendError => "backend-error",
    }
}

pub fn wall_clock(epoch_ms: u64) -> String {
    i64::try_from(epoch_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| epoch_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugtrail_core_types::{Event, EventKind, KeyIssue, Severity};
    use pretty_assertions::assert_eq;

    fn sample() -> Timeline {
        Timeline {
            events: vec![
                Event::marker(EventKind::RecordingStart, 1_000, 0),
                Event::marker(EventKind::RecordingEnd, 2_000, 1_000),
            ],
            summary: Summary {
                network_requests: 2,
                network_failures: 1,
                ..Summary::default()
            },
            key_issues: vec![KeyIssue {
                kind: KeyIssueKind::NetworkFailure,
                description: "GET /api/data failed".into(),
                relative_ms: 800,
                severity: Severity::Error,
                is_root_cause: true,
            }],
        }
    }

    #[test]
    fn human_timeline_marks_the_root_cause() {
        let text = timeline_human(&sample());
        assert!(text.contains("2 requests (1 failed)"));
        assert!(text.contains("* +800ms network-failure"));
        assert!(text.contains("recording-start"));
        assert!(text.contains("recording-end"));
    }

    #[test]
    fn machine_formats_serialize_the_value() {
        let timeline = sample();
        let json = render(&timeline, OutputFormat::Json, timeline_human).unwrap();
        let parsed: Timeline = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, timeline);

        let yaml = render(&timeline, OutputFormat::Yaml, timeline_human).unwrap();
        assert!(yaml.contains("key_issues:"));
    }

    #[test]
    fn wall_clock_is_rfc3339() {
        assert_eq!(wall_clock(0), "1970-01-01T00:00:00.000Z");
    }
}
