use serde::{Deserialize, Serialize};

/// Tuning of the in-page adapters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Source URL prefixes of the recorder's own injected code. Console output originating
    /// there is suppressed.
    pub self_source_prefixes: Vec<String>,
    /// Stack frames kept per console or window error.
    pub max_stack_frames: usize,
    /// Name of the runtime binding the observer script reports through.
    pub binding_name: String,
    /// Keys recorded as key presses; everything else is ignored.
    pub key_allow_list: Vec<String>,
    /// Properties rendered from an object preview before eliding.
    pub preview_max_properties: usize,
    /// Longest recorded input value, in characters.
    pub max_value_chars: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            self_source_prefixes: vec!["chrome-extension://".into(), "bugtrail://".into()],
            max_stack_frames: 3,
            binding_name: "__bugtrailReport".into(),
            key_allow_list: vec!["Enter".into(), "Escape".into(), "Tab".into()],
            preview_max_properties: 5,
            max_value_chars: 200,
        }
    }
}

impl ObserverConfig {
    pub fn is_self_source(&self, url: &str) -> bool {
        self.self_source_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    pub fn mentions_self_source(&self, frame: &str) -> bool {
        self.self_source_prefixes
            .iter()
            .any(|prefix| frame.contains(prefix.as_str()))
    }
}
