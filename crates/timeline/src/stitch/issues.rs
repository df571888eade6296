use bugtrail_core_types::{Event, EventKind, KeyIssue, KeyIssueKind, Summary};

/// Counts per category; collapsed events count once per repeat.
pub fn summarize(events: &[Event]) -> Summary {
    let mut summary = Summary::default();
    for event in events {
        let n = u64::from(event.repeat_count);
        match event.kind {
            EventKind::UserInteraction => summary.interactions += n,
            EventKind::Network => {
                summary.network_requests += n;
                if event.is_network_failure() {
                    summary.network_failures += n;
                }
            }
            EventKind::ConsoleError => summary.console_errors += n,
            EventKind::ConsoleWarning => summary.console_warnings += n,
            EventKind::ConsoleLog => summary.console_logs += n,
            EventKind::BackendLog | EventKind::BackendWarn => summary.backend_logs += n,
            EventKind::BackendError => summary.backend_errors += n,
            EventKind::RecordingStart | EventKind::RecordingEnd => {}
        }
    }
    summary
}

/// Faults worth showing first, earliest first. The earliest one is the root-cause candidate.
pub fn key_issues(events: &[Event]) -> Vec<KeyIssue> {
    let mut issues: Vec<KeyIssue> = events
        .iter()
        .filter_map(|event| {
            let kind = match event.kind {
                EventKind::ConsoleError => KeyIssueKind::ConsoleError,
                EventKind::BackendError => KeyIssueKind::BackendError,
                EventKind::Network if event.is_network_failure() => KeyIssueKind::NetworkFailure,
                _ => return None,
            };
            Some(KeyIssue {
                kind,
                description: event.message.clone(),
                relative_ms: event.relative_ms,
                severity: event.severity,
                is_root_cause: false,
            })
        })
        .collect();

    issues.sort_by_key(|issue| issue.relative_ms);
    if let Some(first) = issues.first_mut() {
        first.is_root_cause = true;
    }
    issues
}
