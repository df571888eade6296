//! Layered configuration.
//!
//! Built-in defaults, then an optional YAML/TOML/JSON file, then `BUGTRAIL_` environment
//! variables with `__` between path segments (`BUGTRAIL_HUB__HEARTBEAT_INTERVAL_MS=5000`).

use std::path::{Path, PathBuf};

use backend_log_client::ClientConfig;
use cdp_adapter::CdpConfig;
use config::{Config, Environment, File};
use network_tap::TapConfig;
use page_observers::ObserverConfig;
use serde::{Deserialize, Serialize};
use session_recorder::{HubConfig, RecorderConfig};
use timeline::CorrelatorPolicy;

use crate::errors::{BugtrailError, BugtrailResult};

pub const ENV_PREFIX: &str = "BUGTRAIL";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Settings of the `record` command that are not owned by a library crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSettings {
    /// Ask backend clients for debug and trace output too.
    pub capture_stdout: bool,
    pub skip_observer_injection: bool,
    /// Serve the backend log hub while recording.
    pub serve_hub: bool,
    /// Port of the prometheus endpoint; 0 disables it.
    pub metrics_port: u16,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            capture_stdout: false,
            skip_observer_injection: false,
            serve_hub: true,
            metrics_port: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BugtrailConfig {
    pub logging: LoggingConfig,
    pub cdp: CdpConfig,
    pub tap: TapConfig,
    pub observer: ObserverConfig,
    pub hub: HubConfig,
    pub client: ClientConfig,
    pub correlator: CorrelatorPolicy,
    pub record: RecordSettings,
}

impl BugtrailConfig {
    /// Loads defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> BugtrailResult<Self> {
        let defaults = Config::try_from(&BugtrailConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = file {
            if !path.exists() {
                return Err(BugtrailError::MissingConfig(path.to_path_buf()));
            }
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: BugtrailConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads from an explicit path, or from the default location when one exists.
    pub fn discover(explicit: Option<&Path>) -> BugtrailResult<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.exists()),
        };
        let cfg = Self::load(path.as_deref())?;
        Ok((cfg, path))
    }

    pub fn validate(&self) -> BugtrailResult<()> {
        if self.correlator.dedup_window_ms > 60_000 {
            return Err(BugtrailError::InvalidConfig(
                "correlator.dedup_window_ms must not exceed 60000".into(),
            ));
        }
        if self.client.max_attempts == 0 {
            return Err(BugtrailError::InvalidConfig(
                "client.max_attempts must be at least 1".into(),
            ));
        }
        if self.client.base_backoff_ms > self.client.max_backoff_ms {
            return Err(BugtrailError::InvalidConfig(
                "client.base_backoff_ms must not exceed client.max_backoff_ms".into(),
            ));
        }
        if !self.hub.websocket_path.starts_with('/') || !self.hub.health_path.starts_with('/') {
            return Err(BugtrailError::InvalidConfig(
                "hub paths must start with '/'".into(),
            ));
        }
        Ok(())
    }

    pub fn recorder(&self) -> RecorderConfig {
        RecorderConfig {
            observer: self.observer.clone(),
            tap: self.tap.clone(),
            skip_observer_injection: self.record.skip_observer_injection,
        }
    }
}

/// `./bugtrail.yaml` when present, else `<config dir>/bugtrail/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("bugtrail.yaml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir().map(|mut path| {
        path.push("bugtrail");
        path.push("config.yaml");
        path
    })
}
