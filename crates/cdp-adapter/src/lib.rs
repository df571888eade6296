//! Bugtrail inspection channel.
//!
//! This crate owns the Chromium DevTools Protocol connection. Features never talk to the
//! connection directly: they go through [`InspectionManager`], which attaches one CDP session per
//! tab, reference-counts the features using it and enables only the protocol domains those
//! features need. Events arriving on a tab's session are routed to the subscribers registered for
//! that tab.

use std::{env, path::PathBuf};

use which::which;

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
    pub enum AdapterErrorKind {
        #[error("attach to target failed")]
        AttachFailed,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("command timed out")]
        CommandTimeout,
        #[error("tab is not attached")]
        NotAttached,
        #[error("target is gone")]
        TargetGone,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{
        env,
        path::{Path, PathBuf},
    };

    /// Configuration for reaching the browser and tuning the inspection channel.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CdpConfig {
        /// Browser-level DevTools websocket of an already running browser. When unset a browser
        /// is launched from `executable`.
        pub websocket_url: Option<String>,
        pub executable: PathBuf,
        pub user_data_dir: PathBuf,
        pub headless: bool,
        pub default_deadline_ms: u64,
        pub heartbeat_interval_ms: u64,
        /// Capacity of each per-tab subscriber queue.
        pub subscriber_buffer: usize,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                websocket_url: None,
                executable: default_chrome_path(),
                user_data_dir: default_profile_dir(),
                headless: resolve_headless_default(),
                default_deadline_ms: 10_000,
                heartbeat_interval_ms: 15_000,
                subscriber_buffer: 1024,
            }
        }
    }

    fn resolve_headless_default() -> bool {
        // Recording watches a page the developer is using, so default to a visible window.
        match env::var("BUGTRAIL_HEADLESS") {
            Ok(value) => matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            Err(_) => false,
        }
    }

    fn default_chrome_path() -> PathBuf {
        detect_chrome_executable().unwrap_or_default()
    }

    fn default_profile_dir() -> PathBuf {
        if let Ok(path) = env::var("BUGTRAIL_CHROME_PROFILE") {
            return PathBuf::from(path);
        }
        Path::new("./.bugtrail-profile").into()
    }
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("BUGTRAIL_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("BUGTRAIL_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);

    if !skip_defaults {
        for candidate in os_specific_chrome_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "freebsd")))]
    {
        Vec::new()
    }
}

pub mod attachment;
pub mod metrics;
pub mod router;
pub mod transport;
pub mod util;

pub use attachment::{Domain, Feature, InspectionManager};
pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use metrics::AdapterMetricsSnapshot;
pub use router::TabSubscription;
pub use transport::{
    CdpTransport, ChromiumTransport, CommandTarget, NoopTransport, TransportEvent,
};
