//! Shared primitives for Bugtrail.
//!
//! Every crate in the workspace speaks these types: tab/session identifiers, the common
//! [`Event`] shape produced by the adapters, the [`Timeline`] produced by the correlator, and the
//! frames exchanged between the backend log hub and the clients embedded in observed processes.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod backend;
pub mod event;
pub mod timeline;

pub use backend::{BackendLevel, ClientFrame, LogRecord, ServerFrame};
pub use event::{
    BackendPayload, ConsoleLevel, ConsoleOrigin, ConsolePayload, Event, EventKind, EventPayload,
    InteractionAction, InteractionPayload, NetworkPayload, Severity,
};
pub use timeline::{KeyIssue, KeyIssueKind, Summary, Timeline};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("tab identifier must not be empty")]
    EmptyTabId,
}

/// Identifier of a browser tab; in CDP terms the page target id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptyTabId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one recording session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
