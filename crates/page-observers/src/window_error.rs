//! Window-error adapter: the page's own `error` and `unhandledrejection` listeners.
//!
//! This is a fallback for faults the runtime channel misses. The same fault is often reported
//! twice, so messages take the shape `Runtime.exceptionThrown` produces (`Uncaught <description>`,
//! `Uncaught (in promise) <description>`) and the correlator's dedup pass collapses the pair.

use bugtrail_core_types::{ConsoleLevel, ConsoleOrigin, ConsolePayload, Event};
use serde::Deserialize;

use crate::config::ObserverConfig;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WindowErrorKind {
    Error,
    UnhandledRejection,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WindowErrorReport {
    pub kind: WindowErrorKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
    /// Raw `Error.stack` text, when the thrown value carried one.
    #[serde(default)]
    pub stack: Option<String>,
}

pub struct WindowErrorAdapter {
    cfg: ObserverConfig,
}

impl WindowErrorAdapter {
    pub fn new(cfg: ObserverConfig) -> Self {
        Self { cfg }
    }

    pub fn handle(
        &self,
        report: WindowErrorReport,
        timestamp_ms: u64,
        relative_ms: u64,
    ) -> Option<Event> {
        if report
            .source
            .as_deref()
            .is_some_and(|source| self.cfg.is_self_source(source))
        {
            return None;
        }

        let frames: Vec<String> = report
            .stack
            .as_deref()
            .map(stack_lines)
            .unwrap_or_default();
        if frames.iter().any(|frame| self.cfg.mentions_self_source(frame)) {
            return None;
        }

        let detail = report.message.trim();
        let message = match report.kind {
            WindowErrorKind::Error if detail.starts_with("Uncaught") => detail.to_string(),
            WindowErrorKind::Error if detail.is_empty() => "Uncaught error".to_string(),
            WindowErrorKind::Error => format!("Uncaught {detail}"),
            WindowErrorKind::UnhandledRejection => match rejection_description(&report) {
                Some(description) => format!("{REJECTION_PREFIX} {description}"),
                None => REJECTION_PREFIX.to_string(),
            },
        };

        Some(Event::console(
            timestamp_ms,
            relative_ms,
            message,
            ConsolePayload {
                level: ConsoleLevel::Error,
                origin: ConsoleOrigin::WindowError,
                url: report.source.filter(|source| !source.is_empty()),
                line: report.line,
                column: report.column,
                stack: frames
                    .into_iter()
                    .take(self.cfg.max_stack_frames)
                    .collect(),
            },
        ))
    }
}

const REJECTION_PREFIX: &str = "Uncaught (in promise)";

/// The first line of the rejection reason, as the runtime's exception description renders it.
/// An `Error.stack` header (`TypeError: boom`) wins over a bare message.
fn rejection_description(report: &WindowErrorReport) -> Option<String> {
    let header = report
        .stack
        .as_deref()
        .and_then(|stack| stack.lines().next())
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("at "));
    let message = report.message.lines().next().map(str::trim);
    header
        .or(message)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
}

/// Keeps the frame lines of an `Error.stack` string, dropping the leading message line.
fn stack_lines(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("at ") || line.contains('@'))
        .map(|line| line.trim_start_matches("at ").to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugtrail_core_types::EventKind;

    fn report(kind: WindowErrorKind, message: &str) -> WindowErrorReport {
        WindowErrorReport {
            kind,
            message: message.into(),
            source: Some("http://localhost:3000/app.js".into()),
            line: Some(12),
            column: Some(3),
            stack: Some(
                "Error: boom\n    at a (app.js:12:3)\n    at b (app.js:20:1)\n    at c (app.js:30:1)\n    at d (app.js:40:1)"
                    .into(),
            ),
        }
    }

    #[test]
    fn error_becomes_console_error_with_prefix() {
        let adapter = WindowErrorAdapter::new(ObserverConfig::default());
        let event = adapter
            .handle(report(WindowErrorKind::Error, "Error: boom"), 1, 1)
            .unwrap();
        assert_eq!(event.kind, EventKind::ConsoleError);
        assert_eq!(event.message, "Uncaught Error: boom");
        let payload = event.console_payload().unwrap();
        assert_eq!(payload.origin, ConsoleOrigin::WindowError);
        assert_eq!(payload.stack, vec!["a (app.js:12:3)", "b (app.js:20:1)", "c (app.js:30:1)"]);
    }

    #[test]
    fn already_prefixed_message_is_kept() {
        let adapter = WindowErrorAdapter::new(ObserverConfig::default());
        let event = adapter
            .handle(report(WindowErrorKind::Error, "Uncaught TypeError: x"), 1, 1)
            .unwrap();
        assert_eq!(event.message, "Uncaught TypeError: x");
    }

    #[test]
    fn rejection_takes_the_runtime_shape() {
        let adapter = WindowErrorAdapter::new(ObserverConfig::default());
        let event = adapter
            .handle(report(WindowErrorKind::UnhandledRejection, "boom"), 1, 1)
            .unwrap();
        assert_eq!(event.message, "Uncaught (in promise) Error: boom");

        let mut plain = report(WindowErrorKind::UnhandledRejection, "timeout");
        plain.stack = None;
        let event = adapter.handle(plain, 1, 1).unwrap();
        assert_eq!(event.message, "Uncaught (in promise) timeout");

        let mut empty = report(WindowErrorKind::UnhandledRejection, "");
        empty.stack = None;
        let event = adapter.handle(empty, 1, 1).unwrap();
        assert_eq!(event.message, "Uncaught (in promise)");
    }

    #[test]
    fn own_script_errors_are_dropped() {
        let adapter = WindowErrorAdapter::new(ObserverConfig::default());
        let mut own = report(WindowErrorKind::Error, "boom");
        own.source = Some("bugtrail://instrumentation/observer.js".into());
        assert!(adapter.handle(own, 1, 1).is_none());

        let mut nested = report(WindowErrorKind::Error, "boom");
        nested.stack = Some("Error\n    at send (bugtrail://instrumentation/observer.js:4:2)".into());
        assert!(adapter.handle(nested, 1, 1).is_none());
    }
}
