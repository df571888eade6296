//! The observer script injected into recorded pages.

use crate::config::ObserverConfig;

const TEMPLATE: &str = include_str!("../assets/observer.js");

/// Source URL stamped on the injected script; frames from it are recognised as our own.
pub const SCRIPT_URL: &str = "bugtrail://instrumentation/observer.js";

/// Renders the observer for the configured binding name and key allow-list.
pub fn observer_script(cfg: &ObserverConfig) -> String {
    let keys = serde_json::to_string(&cfg.key_allow_list).unwrap_or_else(|_| "[]".to_string());
    let binding = cfg.binding_name.replace(['"', '\\'], "");
    format!(
        "{}\n//# sourceURL={SCRIPT_URL}\n",
        TEMPLATE
            .replace("__BINDING__", &binding)
            .replace("__KEYS__", &keys)
    )
}
