use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BugtrailError {
    #[error("configuration file {0} does not exist")]
    MissingConfig(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("configuration could not be loaded: {0}")]
    Config(#[from] config::ConfigError),
    #[error("no page target to record; open a tab or pass --url")]
    NoTab,
    #[error(transparent)]
    Inspection(#[from] cdp_adapter::AdapterError),
    #[error(transparent)]
    Session(#[from] session_recorder::SessionError),
    #[error(transparent)]
    Timeline(#[from] timeline::TlError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml output failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type BugtrailResult<T> = Result<T, BugtrailError>;
