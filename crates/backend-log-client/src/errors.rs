use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("socket error: {0}")]
    Socket(String),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("backend logging is disabled")]
    Disabled,
}

pub type ClientResult<T> = Result<T, ClientError>;
