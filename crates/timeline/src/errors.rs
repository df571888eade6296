use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("malformed raw events: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TlResult<T> = Result<T, TlError>;
