//! In-page adapters for Bugtrail.
//!
//! [`PageObservers`] takes the raw protocol events of one tab and turns the console, runtime and
//! observer-binding traffic into timeline events. Network traffic is handled by `network-tap`.

pub mod config;
pub mod console;
pub mod errors;
pub mod interaction;
pub mod script;
pub mod window_error;

use bugtrail_core_types::Event;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub use config::ObserverConfig;
pub use console::ConsoleAdapter;
pub use errors::{ObserveError, ObserveResult};
pub use interaction::{InteractionAdapter, InteractionReport, PathNode, TargetInfo};
pub use script::{observer_script, SCRIPT_URL};
pub use window_error::{WindowErrorAdapter, WindowErrorKind, WindowErrorReport};

/// A message posted by the observer script through the runtime binding.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Report {
    Interaction(InteractionReport),
    WindowError(WindowErrorReport),
}

impl Report {
    pub fn parse(payload: &str) -> ObserveResult<Self> {
        serde_json::from_str(payload).map_err(|err| ObserveError::BadReport(err.to_string()))
    }
}

/// Console, interaction and window-error adapters behind one dispatcher.
pub struct PageObservers {
    binding_name: String,
    console: ConsoleAdapter,
    interaction: InteractionAdapter,
    window_error: WindowErrorAdapter,
}

impl PageObservers {
    pub fn new(cfg: ObserverConfig) -> Self {
        Self {
            binding_name: cfg.binding_name.clone(),
            console: ConsoleAdapter::new(cfg.clone()),
            interaction: InteractionAdapter::new(cfg.clone()),
            window_error: WindowErrorAdapter::new(cfg),
        }
    }

    pub fn binding_name(&self) -> &str {
        &self.binding_name
    }

    /// True when `method` is one this dispatcher consumes.
    pub fn handles(method: &str) -> bool {
        ConsoleAdapter::handles(method) || method == "Runtime.bindingCalled"
    }

    /// Converts one protocol event of the tab.
    ///
    /// `Ok(None)` covers events that were recognised but filtered (own instrumentation, keys
    /// outside the allow-list, foreign bindings) and methods this dispatcher does not consume.
    pub fn ingest(
        &self,
        method: &str,
        params: &Value,
        timestamp_ms: u64,
        relative_ms: u64,
    ) -> ObserveResult<Option<Event>> {
        if ConsoleAdapter::handles(method) {
            return self.console.handle(method, params, timestamp_ms, relative_ms);
        }
        if method != "Runtime.bindingCalled" {
            return Ok(None);
        }

        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        if name != self.binding_name {
            debug!(target: "page-observers", binding = name, "ignoring foreign binding call");
            return Ok(None);
        }
        let payload = params
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| ObserveError::malformed(method, "missing payload"))?;

        Ok(match Report::parse(payload)? {
            Report::Interaction(report) => {
                self.interaction.handle(report, timestamp_ms, relative_ms)
            }
            Report::WindowError(report) => {
                self.window_error.handle(report, timestamp_ms, relative_ms)
            }
        })
    }
}

impl Default for PageObservers {
    fn default() -> Self {
        Self::new(ObserverConfig::default())
    }
}
