use serde::{Deserialize, Serialize};

/// Tolerances and noise rules of the correlator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorPolicy {
    /// Adjacent identical events at most this far apart collapse into one.
    pub dedup_window_ms: u64,
    /// Console messages longer than this many characters are truncated.
    pub message_cap: usize,
    /// Console events whose source URL or stack frames carry one of these prefixes come from
    /// the recorder's own instrumentation.
    pub self_source_prefixes: Vec<String>,
    /// Network requests whose URL contains one of these paths hit the recorder's control plane.
    pub self_endpoints: Vec<String>,
    /// Request methods that never reach the timeline, compared case-insensitively.
    pub ignored_methods: Vec<String>,
}

impl Default for CorrelatorPolicy {
    fn default() -> Self {
        Self {
            dedup_window_ms: 100,
            message_cap: 300,
            self_source_prefixes: vec!["chrome-extension://".into(), "bugtrail://".into()],
            self_endpoints: vec!["/__bugtrail/".into()],
            ignored_methods: vec!["OPTIONS".into()],
        }
    }
}
