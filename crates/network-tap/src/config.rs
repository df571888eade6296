//! Configuration types for the network tap.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Upper bound of in-flight requests remembered per tab. The oldest entry is evicted first.
    pub max_pending: usize,
    /// Requests whose URL starts with one of these prefixes are never recorded.
    pub ignored_url_prefixes: Vec<String>,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            max_pending: 2048,
            ignored_url_prefixes: vec!["data:".into(), "blob:".into()],
        }
    }
}
