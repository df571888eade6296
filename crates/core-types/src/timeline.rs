use serde::{Deserialize, Serialize};

use crate::event::{Event, Severity};

/// Per-category counts of a finished timeline. Collapsed events count once per repeat.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub interactions: u64,
    pub network_requests: u64,
    pub network_failures: u64,
    pub console_errors: u64,
    pub console_warnings: u64,
    pub console_logs: u64,
    pub backend_logs: u64,
    pub backend_errors: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyIssueKind {
    ConsoleError,
    NetworkFailure,
    BackendError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIssue {
    pub kind: KeyIssueKind,
    pub description: String,
    pub relative_ms: u64,
    pub severity: Severity,
    pub is_root_cause: bool,
}

/// Correlated output of one session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<Event>,
    pub summary: Summary,
    pub key_issues: Vec<KeyIssue>,
}

impl Timeline {
    pub fn root_cause(&self) -> Option<&KeyIssue> {
        self.key_issues.iter().find(|issue| issue.is_root_cause)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
