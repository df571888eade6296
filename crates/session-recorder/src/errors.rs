use bugtrail_core_types::TabId;
use cdp_adapter::AdapterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tab {0} is already being recorded")]
    AlreadyRecording(TabId),
    #[error("tab {0} is not being recorded")]
    NotRecording(TabId),
    #[error("inspection channel unavailable: {0}")]
    Inspection(#[from] AdapterError),
    #[error("backend log hub failed: {0}")]
    Hub(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
