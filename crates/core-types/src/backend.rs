//! Frames exchanged between the backend log hub and the clients embedded in observed processes.
//!
//! Frames are JSON text messages tagged by `type`; field names follow the camelCase wire form.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendLevel {
    #[serde(alias = "info", alias = "debug", alias = "trace")]
    Log,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: BackendLevel,
    pub message: String,
    /// Epoch milliseconds at which the observed process produced the record.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Client → hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        #[serde(rename = "serverPort")]
        server_port: u16,
    },
    Log(LogRecord),
    Pong,
}

/// Hub → client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    StartRecording {
        #[serde(rename = "captureStdout", default)]
        capture_stdout: bool,
    },
    StopRecording,
    Ping,
}
