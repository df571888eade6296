use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserveError {
    #[error("malformed {method} event: {reason}")]
    Malformed { method: String, reason: String },
    #[error("unreadable observer report: {0}")]
    BadReport(String),
}

impl ObserveError {
    pub(crate) fn malformed(method: &str, reason: impl Into<String>) -> Self {
        ObserveError::Malformed {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ObserveResult<T> = Result<T, ObserveError>;
