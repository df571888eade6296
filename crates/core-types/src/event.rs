//! The common event shape every adapter produces.

use serde::{Deserialize, Serialize};

/// Category of a timeline event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Network,
    ConsoleLog,
    ConsoleWarning,
    ConsoleError,
    UserInteraction,
    BackendLog,
    BackendWarn,
    BackendError,
    RecordingStart,
    RecordingEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Network => "network",
            EventKind::ConsoleLog => "console-log",
            EventKind::ConsoleWarning => "console-warning",
            EventKind::ConsoleError => "console-error",
            EventKind::UserInteraction => "user-interaction",
            EventKind::BackendLog => "backend-log",
            EventKind::BackendWarn => "backend-warn",
            EventKind::BackendError => "backend-error",
            EventKind::RecordingStart => "recording-start",
            EventKind::RecordingEnd => "recording-end",
        }
    }

    pub fn is_console(&self) -> bool {
        matches!(
            self,
            EventKind::ConsoleLog | EventKind::ConsoleWarning | EventKind::ConsoleError
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// Maps a CDP console/log level string onto the three levels the timeline keeps.
    pub fn from_cdp(raw: &str) -> Self {
        match raw {
            "error" | "assert" => ConsoleLevel::Error,
            "warning" | "warn" => ConsoleLevel::Warn,
            _ => ConsoleLevel::Log,
        }
    }
}

/// Which raw signal a console event was reconstructed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleOrigin {
    ConsoleApi,
    LogEntry,
    Exception,
    WindowError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPayload {
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl NetworkPayload {
    fn render(&self) -> String {
        match (self.status, self.error_text.as_deref()) {
            (Some(status), _) => {
                let text = self.status_text.as_deref().unwrap_or("").trim();
                if text.is_empty() {
                    format!("{} {} → {}", self.method, self.url, status)
                } else {
                    format!("{} {} → {} {}", self.method, self.url, status, text)
                }
            }
            (None, Some(error)) => format!("{} {} failed: {}", self.method, self.url, error),
            (None, None) => format!("{} {}", self.method, self.url),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolePayload {
    pub level: ConsoleLevel,
    pub origin: ConsoleOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Click,
    Input,
    KeyPress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionPayload {
    pub action: InteractionAction,
    pub selector: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl InteractionPayload {
    fn render(&self) -> String {
        match self.action {
            InteractionAction::Click => format!("click on {}", self.selector),
            InteractionAction::Input => match &self.value {
                Some(value) => format!("input on {} = \"{}\"", self.selector, value),
                None => format!("input on {}", self.selector),
            },
            InteractionAction::KeyPress => format!(
                "key {} on {}",
                self.key.as_deref().unwrap_or("?"),
                self.selector
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPayload {
    pub level: crate::BackendLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EventPayload {
    Network(NetworkPayload),
    Console(ConsolePayload),
    Interaction(InteractionPayload),
    Backend(BackendPayload),
    Marker,
}

/// One entry of a session's timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub relative_ms: u64,
    pub severity: Severity,
    pub message: String,
    #[serde(default = "default_repeat")]
    pub repeat_count: u32,
    pub payload: EventPayload,
}

fn default_repeat() -> u32 {
    1
}

impl Event {
    pub fn network(timestamp_ms: u64, relative_ms: u64, payload: NetworkPayload) -> Self {
        let severity = if payload.ok {
            Severity::Info
        } else {
            Severity::Error
        };
        Self {
            kind: EventKind::Network,
            timestamp_ms,
            relative_ms,
            severity,
            message: payload.render(),
            repeat_count: 1,
            payload: EventPayload::Network(payload),
        }
    }

    pub fn console(
        timestamp_ms: u64,
        relative_ms: u64,
        message: impl Into<String>,
        payload: ConsolePayload,
    ) -> Self {
        let (kind, severity) = match payload.level {
            ConsoleLevel::Log => (EventKind::ConsoleLog, Severity::Info),
            ConsoleLevel::Warn => (EventKind::ConsoleWarning, Severity::Warning),
            ConsoleLevel::Error => (EventKind::ConsoleError, Severity::Error),
        };
        Self {
            kind,
            timestamp_ms,
            relative_ms,
            severity,
            message: message.into(),
            repeat_count: 1,
            payload: EventPayload::Console(payload),
        }
    }

    pub fn interaction(timestamp_ms: u64, relative_ms: u64, payload: InteractionPayload) -> Self {
        Self {
            kind: EventKind::UserInteraction,
            timestamp_ms,
            relative_ms,
            severity: Severity::Info,
            message: payload.render(),
            repeat_count: 1,
            payload: EventPayload::Interaction(payload),
        }
    }

    pub fn backend(
        timestamp_ms: u64,
        relative_ms: u64,
        message: impl Into<String>,
        payload: BackendPayload,
    ) -> Self {
        let (kind, severity) = match payload.level {
            crate::BackendLevel::Log => (EventKind::BackendLog, Severity::Info),
            crate::BackendLevel::Warn => (EventKind::BackendWarn, Severity::Warning),
            crate::BackendLevel::Error => (EventKind::BackendError, Severity::Error),
        };
        Self {
            kind,
            timestamp_ms,
            relative_ms,
            severity,
            message: message.into(),
            repeat_count: 1,
            payload: EventPayload::Backend(payload),
        }
    }

    pub fn marker(kind: EventKind, timestamp_ms: u64, relative_ms: u64) -> Self {
        let message = match kind {
            EventKind::RecordingEnd => "recording stopped",
            _ => "recording started",
        };
        Self {
            kind,
            timestamp_ms,
            relative_ms,
            severity: Severity::Info,
            message: message.to_string(),
            repeat_count: 1,
            payload: EventPayload::Marker,
        }
    }

    /// True for network events whose outcome was a failure.
    pub fn is_network_failure(&self) -> bool {
        matches!(&self.payload, EventPayload::Network(net) if !net.ok)
    }

    pub fn network_payload(&self) -> Option<&NetworkPayload> {
        match &self.payload {
            EventPayload::Network(net) => Some(net),
            _ => None,
        }
    }

    pub fn console_payload(&self) -> Option<&ConsolePayload> {
        match &self.payload {
            EventPayload::Console(console) => Some(console),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_request() -> NetworkPayload {
        NetworkPayload {
            request_id: "r1".into(),
            url: "/api/data".into(),
            method: "GET".into(),
            status: Some(500),
            status_text: Some("Internal Server Error".into()),
            ok: false,
            ..NetworkPayload::default()
        }
    }

    #[test]
    fn network_failure_is_error_severity() {
        let event = Event::network(10, 0, failed_request());
        assert_eq!(event.severity, Severity::Error);
        assert!(event.is_network_failure());
        assert_eq!(event.message, "GET /api/data → 500 Internal Server Error");
    }

    #[test]
    fn loading_failure_renders_error_text() {
        let payload = NetworkPayload {
            status: None,
            status_text: None,
            error_text: Some("net::ERR_CONNECTION_REFUSED".into()),
            ..failed_request()
        };
        let event = Event::network(10, 0, payload);
        assert_eq!(
            event.message,
            "GET /api/data failed: net::ERR_CONNECTION_REFUSED"
        );
    }

    #[test]
    fn console_level_maps_to_kind() {
        let payload = ConsolePayload {
            level: ConsoleLevel::from_cdp("warning"),
            origin: ConsoleOrigin::ConsoleApi,
            url: None,
            line: None,
            column: None,
            stack: Vec::new(),
        };
        let event = Event::console(0, 0, "careful", payload);
        assert_eq!(event.kind, EventKind::ConsoleWarning);
        assert_eq!(event.severity, Severity::Warning);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&EventKind::UserInteraction).unwrap();
        assert_eq!(json, "\"user-interaction\"");
        assert_eq!(EventKind::BackendWarn.as_str(), "backend-warn");
    }
}
