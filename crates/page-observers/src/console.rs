//! Console/runtime adapter.
//!
//! Normalizes `Runtime.consoleAPICalled`, `Log.entryAdded` and `Runtime.exceptionThrown` into
//! console events. Messages are rebuilt from the protocol's remote-object argument lists; object
//! previews are rendered lossily and fall back to [`PLACEHOLDER`] when nothing readable is left.

use bugtrail_core_types::{ConsoleLevel, ConsoleOrigin, ConsolePayload, Event};
use serde_json::Value;
use tracing::trace;

use crate::config::ObserverConfig;
use crate::errors::{ObserveError, ObserveResult};

pub const PLACEHOLDER: &str = "[object]";

pub struct ConsoleAdapter {
    cfg: ObserverConfig,
}

impl ConsoleAdapter {
    pub fn new(cfg: ObserverConfig) -> Self {
        Self { cfg }
    }

    pub fn handles(method: &str) -> bool {
        matches!(
            method,
            "Runtime.consoleAPICalled" | "Log.entryAdded" | "Runtime.exceptionThrown"
        )
    }

    /// Converts one protocol event. `Ok(None)` means the event was recognised but suppressed.
    pub fn handle(
        &self,
        method: &str,
        params: &Value,
        timestamp_ms: u64,
        relative_ms: u64,
    ) -> ObserveResult<Option<Event>> {
        let draft = match method {
            "Runtime.consoleAPICalled" => self.console_api(params)?,
            "Log.entryAdded" => self.log_entry(params)?,
            "Runtime.exceptionThrown" => self.exception(params)?,
            _ => return Ok(None),
        };
        let Some(draft) = draft else {
            return Ok(None);
        };

        let own_url = draft
            .url
            .as_deref()
            .map(|url| self.cfg.is_self_source(url))
            .unwrap_or(false);
        if own_url
            || draft
                .all_frames
                .iter()
                .any(|frame| self.cfg.mentions_self_source(frame))
        {
            trace!(target: "page-observers", message = %draft.message, "own instrumentation suppressed");
            return Ok(None);
        }

        let mut stack = draft.all_frames;
        stack.truncate(self.cfg.max_stack_frames);
        Ok(Some(Event::console(
            timestamp_ms,
            relative_ms,
            draft.message,
            ConsolePayload {
                level: draft.level,
                origin: draft.origin,
                url: draft.url,
                line: draft.line,
                column: draft.column,
                stack,
            },
        )))
    }

    fn console_api(&self, params: &Value) -> ObserveResult<Option<Draft>> {
        let method = "Runtime.consoleAPICalled";
        let kind = params
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ObserveError::malformed(method, "missing type"))?;
        // Group bookkeeping and timers carry no message worth keeping.
        if matches!(kind, "endGroup" | "clear" | "profile" | "profileEnd") {
            return Ok(None);
        }
        let args = params
            .get("args")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut message = render_args(args, self.cfg.preview_max_properties);
        if kind == "assert" {
            message = if message.is_empty() {
                "Assertion failed".to_string()
            } else {
                format!("Assertion failed: {message}")
            };
        }

        let frames = stack_frames(params.get("stackTrace"));
        let top = top_frame(params.get("stackTrace"));
        Ok(Some(Draft {
            level: ConsoleLevel::from_cdp(kind),
            origin: ConsoleOrigin::ConsoleApi,
            message,
            url: top.as_ref().map(|frame| frame.0.clone()),
            line: top.as_ref().map(|frame| frame.1),
            column: top.as_ref().map(|frame| frame.2),
            all_frames: frames,
        }))
    }

    fn log_entry(&self, params: &Value) -> ObserveResult<Option<Draft>> {
        let method = "Log.entryAdded";
        let entry = params
            .get("entry")
            .ok_or_else(|| ObserveError::malformed(method, "missing entry"))?;
        let source = entry.get("source").and_then(Value::as_str).unwrap_or("other");
        // Console API calls already arrive through the runtime domain.
        if source == "console-api" {
            return Ok(None);
        }
        let level = entry.get("level").and_then(Value::as_str).unwrap_or("info");
        let text = entry
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ObserveError::malformed(method, "missing text"))?;

        Ok(Some(Draft {
            level: ConsoleLevel::from_cdp(level),
            origin: ConsoleOrigin::LogEntry,
            message: text.to_string(),
            url: entry.get("url").and_then(Value::as_str).map(str::to_string),
            line: entry
                .get("lineNumber")
                .and_then(Value::as_u64)
                .and_then(one_based),
            column: None,
            all_frames: stack_frames(entry.get("stackTrace")),
        }))
    }

    fn exception(&self, params: &Value) -> ObserveResult<Option<Draft>> {
        let method = "Runtime.exceptionThrown";
        let details = params
            .get("exceptionDetails")
            .ok_or_else(|| ObserveError::malformed(method, "missing exceptionDetails"))?;
        let text = details
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("Uncaught");
        // Primitive rejection reasons carry a `value` and no description.
        let description = details
            .get("exception")
            .and_then(|exception| {
                exception
                    .get("description")
                    .and_then(Value::as_str)
                    .or_else(|| exception.get("value").and_then(Value::as_str))
            })
            .and_then(|description| description.lines().next())
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let message = match description {
            Some(first_line) if !text.contains(first_line) => format!("{text} {first_line}"),
            _ => text.to_string(),
        };

        let top = top_frame(details.get("stackTrace"));
        let url = details
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .or_else(|| top.as_ref().map(|frame| frame.0.clone()));

        Ok(Some(Draft {
            level: ConsoleLevel::Error,
            origin: ConsoleOrigin::Exception,
            message,
            url,
            line: details
                .get("lineNumber")
                .and_then(Value::as_u64)
                .and_then(one_based),
            column: details
                .get("columnNumber")
                .and_then(Value::as_u64)
                .and_then(one_based),
            all_frames: stack_frames(details.get("stackTrace")),
        }))
    }
}

/// Converts a zero-based protocol position; out-of-range values are dropped.
fn one_based(position: u64) -> Option<u32> {
    u32::try_from(position).ok().map(|p| p.saturating_add(1))
}

struct Draft {
    level: ConsoleLevel,
    origin: ConsoleOrigin,
    message: String,
    url: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    all_frames: Vec<String>,
}

/// Joins rendered arguments with spaces. When the first argument carries `%c` directives the
/// matching CSS arguments are dropped.
pub fn render_args(args: &[Value], max_properties: usize) -> String {
    let styles = args
        .first()
        .filter(|first| first.get("type").and_then(Value::as_str) == Some("string"))
        .and_then(|first| first.get("value").and_then(Value::as_str))
        .map(|format| format.matches("%c").count())
        .unwrap_or(0);

    args.iter()
        .enumerate()
        .filter(|(index, _)| *index == 0 || *index > styles)
        .map(|(_, arg)| render_remote_object(arg, max_properties))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders one `Runtime.RemoteObject`.
pub fn render_remote_object(object: &Value, max_properties: usize) -> String {
    let kind = object.get("type").and_then(Value::as_str).unwrap_or("");
    let subtype = object.get("subtype").and_then(Value::as_str);

    if let Some(unserializable) = object.get("unserializableValue").and_then(Value::as_str) {
        return unserializable.to_string();
    }

    match (kind, subtype) {
        ("string", _) => object
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ("number" | "boolean", _) => object
            .get("value")
            .map(scalar_to_string)
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        ("undefined", _) => "undefined".to_string(),
        ("object", Some("null")) => "null".to_string(),
        ("object", Some("error")) => description(object)
            .and_then(|text| text.lines().next().map(str::to_string))
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        ("object", _) => object
            .get("preview")
            .and_then(|preview| render_preview(preview, max_properties))
            .or_else(|| description(object))
            .unwrap_or_else(|| PLACEHOLDER.to_string()),
        _ => description(object).unwrap_or_else(|| PLACEHOLDER.to_string()),
    }
}

fn description(object: &Value) -> Option<String> {
    object
        .get("description")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Best-effort rendering of a `Runtime.ObjectPreview`: `[1, 2]` for arrays, `{a: 1}` for plain
/// objects. Returns `None` when the preview holds nothing to show.
pub fn render_preview(preview: &Value, max_properties: usize) -> Option<String> {
    let properties = preview.get("properties").and_then(Value::as_array)?;
    let overflow = preview
        .get("overflow")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || properties.len() > max_properties;
    let is_array = preview.get("subtype").and_then(Value::as_str) == Some("array");

    let mut parts: Vec<String> = properties
        .iter()
        .take(max_properties)
        .map(|property| {
            let value = preview_value(property);
            if is_array {
                value
            } else {
                let name = property.get("name").and_then(Value::as_str).unwrap_or("?");
                format!("{name}: {value}")
            }
        })
        .collect();
    if overflow {
        parts.push("…".to_string());
    }

    if parts.is_empty() {
        return preview
            .get("description")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(|text| {
                if is_array {
                    "[]".to_string()
                } else if text == "Object" {
                    "{}".to_string()
                } else {
                    text.to_string()
                }
            });
    }

    let body = parts.join(", ");
    Some(if is_array {
        format!("[{body}]")
    } else {
        format!("{{{body}}}")
    })
}

fn preview_value(property: &Value) -> String {
    let raw = property.get("value").and_then(Value::as_str);
    match (property.get("type").and_then(Value::as_str), raw) {
        (Some("string"), Some(text)) => format!("\"{text}\""),
        (_, Some(text)) => text.to_string(),
        (Some("function"), None) => "ƒ".to_string(),
        _ => PLACEHOLDER.to_string(),
    }
}

/// Formats `Runtime.StackTrace` call frames as `fn (url:line:col)` with 1-based positions.
pub fn stack_frames(stack: Option<&Value>) -> Vec<String> {
    let Some(frames) = stack
        .and_then(|stack| stack.get("callFrames"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    frames
        .iter()
        .map(|frame| {
            let function = frame
                .get("functionName")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .unwrap_or("<anonymous>");
            let url = frame.get("url").and_then(Value::as_str).unwrap_or("");
            let line = frame
                .get("lineNumber")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .saturating_add(1);
            let column = frame
                .get("columnNumber")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .saturating_add(1);
            format!("{function} ({url}:{line}:{column})")
        })
        .collect()
}

fn top_frame(stack: Option<&Value>) -> Option<(String, u32, u32)> {
    let frame = stack?.get("callFrames")?.as_array()?.first()?;
    let url = frame.get("url").and_then(Value::as_str)?.to_string();
    let position = |key: &str| {
        frame
            .get(key)
            .and_then(Value::as_u64)
            .and_then(one_based)
            .unwrap_or(1)
    };
    let line = position("lineNumber");
    let column = position("columnNumber");
    Some((url, line, column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugtrail_core_types::EventKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn adapter() -> ConsoleAdapter {
        ConsoleAdapter::new(ObserverConfig::default())
    }

    fn frames(url: &str, count: usize) -> Value {
        let frames: Vec<Value> = (0..count)
            .map(|i| json!({ "functionName": format!("f{i}"), "url": url, "lineNumber": i, "columnNumber": 4 }))
            .collect();
        json!({ "callFrames": frames })
    }

    #[test]
    fn rebuilds_message_from_mixed_args() {
        let params = json!({
            "type": "log",
            "args": [
                { "type": "string", "value": "saved" },
                { "type": "number", "value": 3, "description": "3" },
                { "type": "boolean", "value": true },
                { "type": "undefined" },
                { "type": "object", "subtype": "null", "value": null },
                { "type": "number", "unserializableValue": "NaN", "description": "NaN" }
            ],
            "stackTrace": frames("http://localhost:3000/app.js", 1)
        });
        let event = adapter()
            .handle("Runtime.consoleAPICalled", &params, 10, 0)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::ConsoleLog);
        assert_eq!(event.message, "saved 3 true undefined null NaN");
        let payload = event.console_payload().unwrap();
        assert_eq!(payload.url.as_deref(), Some("http://localhost:3000/app.js"));
        assert_eq!(payload.line, Some(1));
    }

    #[test]
    fn renders_object_and_array_previews() {
        let object = json!({
            "type": "object",
            "description": "Object",
            "preview": {
                "type": "object",
                "description": "Object",
                "overflow": false,
                "properties": [
                    { "name": "id", "type": "number", "value": "7" },
                    { "name": "name", "type": "string", "value": "Ada" },
                    { "name": "tags", "type": "object", "subtype": "array", "value": "Array(2)" }
                ]
            }
        });
        assert_eq!(
            render_remote_object(&object, 5),
            "{id: 7, name: \"Ada\", tags: Array(2)}"
        );

        let array = json!({
            "type": "object",
            "subtype": "array",
            "description": "Array(7)",
            "preview": {
                "type": "object",
                "subtype": "array",
                "overflow": true,
                "properties": [
                    { "name": "0", "type": "number", "value": "1" },
                    { "name": "1", "type": "number", "value": "2" }
                ]
            }
        });
        assert_eq!(render_remote_object(&array, 5), "[1, 2, …]");
    }

    #[test]
    fn falls_back_to_description_then_placeholder() {
        let described = json!({ "type": "object", "className": "Map", "description": "Map(2)" });
        assert_eq!(render_remote_object(&described, 5), "Map(2)");
        let bare = json!({ "type": "object" });
        assert_eq!(render_remote_object(&bare, 5), PLACEHOLDER);
    }

    #[test]
    fn drops_css_arguments_of_styled_output() {
        let params = json!({
            "type": "info",
            "args": [
                { "type": "string", "value": "%c[store]%c ready" },
                { "type": "string", "value": "color: purple" },
                { "type": "string", "value": "" },
                { "type": "number", "value": 2 }
            ]
        });
        let event = adapter()
            .handle("Runtime.consoleAPICalled", &params, 0, 0)
            .unwrap()
            .unwrap();
        assert_eq!(event.message, "%c[store]%c ready 2");
    }

    #[test]
    fn suppresses_own_instrumentation() {
        let params = json!({
            "type": "error",
            "args": [{ "type": "string", "value": "observer crashed" }],
            "stackTrace": frames("bugtrail://instrumentation/observer.js", 2)
        });
        assert!(adapter()
            .handle("Runtime.consoleAPICalled", &params, 0, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn caps_stack_at_three_frames() {
        let params = json!({
            "type": "error",
            "args": [{ "type": "string", "value": "bad" }],
            "stackTrace": frames("http://localhost:3000/app.js", 6)
        });
        let event = adapter()
            .handle("Runtime.consoleAPICalled", &params, 0, 0)
            .unwrap()
            .unwrap();
        let stack = &event.console_payload().unwrap().stack;
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0], "f0 (http://localhost:3000/app.js:1:5)");
    }

    #[test]
    fn exception_uses_first_description_line() {
        let params = json!({
            "timestamp": 1.0,
            "exceptionDetails": {
                "exceptionId": 1,
                "text": "Uncaught",
                "lineNumber": 41,
                "columnNumber": 9,
                "url": "http://localhost:3000/app.js",
                "exception": {
                    "type": "object",
                    "subtype": "error",
                    "description": "TypeError: Cannot read properties of undefined (reading 'map')\n    at render (app.js:42:10)"
                }
            }
        });
        let event = adapter()
            .handle("Runtime.exceptionThrown", &params, 0, 0)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::ConsoleError);
        assert_eq!(
            event.message,
            "Uncaught TypeError: Cannot read properties of undefined (reading 'map')"
        );
        assert_eq!(event.console_payload().unwrap().line, Some(42));
    }

    #[test]
    fn log_entries_map_levels_and_skip_console_api() {
        let network = json!({
            "entry": {
                "source": "network",
                "level": "error",
                "text": "Failed to load resource: the server responded with a status of 500",
                "url": "http://localhost:3000/api/data",
                "timestamp": 1.0
            }
        });
        let event = adapter()
            .handle("Log.entryAdded", &network, 0, 0)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::ConsoleError);

        let duplicate = json!({
            "entry": { "source": "console-api", "level": "warning", "text": "dup", "timestamp": 1.0 }
        });
        assert!(adapter()
            .handle("Log.entryAdded", &duplicate, 0, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_positions_are_dropped_not_wrapped() {
        let params = json!({
            "exceptionDetails": {
                "text": "Uncaught",
                "lineNumber": u64::from(u32::MAX) + 7,
                "columnNumber": u32::MAX,
                "exception": { "type": "object", "subtype": "error", "description": "Error: x" }
            }
        });
        let event = adapter()
            .handle("Runtime.exceptionThrown", &params, 0, 0)
            .unwrap()
            .unwrap();
        let payload = event.console_payload().unwrap();
        assert_eq!(payload.line, None);
        assert_eq!(payload.column, Some(u32::MAX));
        assert_eq!(one_based(0), Some(1));
    }

    #[test]
    fn primitive_rejection_reason_is_kept() {
        let params = json!({
            "exceptionDetails": {
                "text": "Uncaught (in promise)",
                "exception": { "type": "string", "value": "timeout" }
            }
        });
        let event = adapter()
            .handle("Runtime.exceptionThrown", &params, 0, 0)
            .unwrap()
            .unwrap();
        assert_eq!(event.message, "Uncaught (in promise) timeout");
    }

    #[test]
    fn malformed_events_are_errors() {
        assert!(adapter()
            .handle("Runtime.exceptionThrown", &json!({}), 0, 0)
            .is_err());
        assert!(adapter()
            .handle("Runtime.consoleAPICalled", &json!({ "args": [] }), 0, 0)
            .is_err());
    }
}
