//! Interaction adapter.
//!
//! The injected observer script reports the raw facts about each click, input and key press:
//! the target's attributes, how many elements share its tag+class combination, and the element
//! path up to the document root. Selector derivation and redaction happen here, per event, with
//! nothing cached between reports.

use bugtrail_core_types::{Event, InteractionAction, InteractionPayload};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::ObserverConfig;

pub const REDACTED: &str = "[redacted]";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub autocomplete: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Elements in the document matching `tag.class1.class2`; absent when the target has no class.
    #[serde(default)]
    pub tag_class_matches: Option<u32>,
}

/// One element on the way from the target to the root, target first.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PathNode {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    /// 1-based position among the parent's element children.
    pub index: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InteractionReport {
    pub action: InteractionAction,
    pub target: TargetInfo,
    #[serde(default)]
    pub path: Vec<PathNode>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

pub struct InteractionAdapter {
    cfg: ObserverConfig,
}

impl InteractionAdapter {
    pub fn new(cfg: ObserverConfig) -> Self {
        Self { cfg }
    }

    /// Returns `None` for key presses outside the allow-list.
    pub fn handle(
        &self,
        report: InteractionReport,
        timestamp_ms: u64,
        relative_ms: u64,
    ) -> Option<Event> {
        let key = match report.action {
            InteractionAction::KeyPress => {
                let key = report.key?;
                if !self.cfg.key_allow_list.iter().any(|allowed| *allowed == key) {
                    return None;
                }
                Some(key)
            }
            _ => None,
        };

        let value = match report.action {
            InteractionAction::Input => report.value.map(|value| {
                if is_sensitive(&report.target) {
                    REDACTED.to_string()
                } else {
                    clip(&value, self.cfg.max_value_chars)
                }
            }),
            _ => None,
        };

        let text = report
            .target
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(|text| clip(text, 80));

        Some(Event::interaction(
            timestamp_ms,
            relative_ms,
            InteractionPayload {
                action: report.action,
                selector: selector_for(&report.target, &report.path),
                tag: report.target.tag.to_ascii_lowercase(),
                value,
                key,
                text,
            },
        ))
    }
}

/// Id first, then a unique tag+class combination, then a positional path.
pub fn selector_for(target: &TargetInfo, path: &[PathNode]) -> String {
    if let Some(id) = usable_id(target.id.as_deref()) {
        return format!("#{}", css_escape(id));
    }

    let tag = target.tag.to_ascii_lowercase();
    if !target.classes.is_empty() && target.tag_class_matches == Some(1) {
        let classes: Vec<String> = target
            .classes
            .iter()
            .map(|class| css_escape(class))
            .collect();
        return format!("{tag}.{}", classes.join("."));
    }

    positional(&tag, path)
}

fn positional(tag: &str, path: &[PathNode]) -> String {
    if path.is_empty() {
        return tag.to_string();
    }
    let mut segments = Vec::with_capacity(path.len());
    for (depth, node) in path.iter().enumerate() {
        let node_tag = node.tag.to_ascii_lowercase();
        if depth > 0 {
            if let Some(id) = usable_id(node.id.as_deref()) {
                segments.push(format!("#{}", css_escape(id)));
                break;
            }
        }
        if node_tag == "html" {
            segments.push(node_tag);
            break;
        }
        segments.push(format!("{node_tag}:nth-child({})", node.index));
    }
    segments.reverse();
    segments.join(" > ")
}

fn usable_id(id: Option<&str>) -> Option<&str> {
    id.map(str::trim)
        .filter(|id| !id.is_empty() && !id.chars().any(char::is_whitespace))
}

/// Escapes an identifier for use in a selector, following `CSS.escape`.
fn css_escape(ident: &str) -> String {
    let mut escaped = String::with_capacity(ident.len());
    let mut chars = ident.chars().peekable();
    let mut first = true;
    let mut leading_dash = false;
    while let Some(ch) = chars.next() {
        let at_start = first || leading_dash;
        match ch {
            '\0' => escaped.push('\u{FFFD}'),
            '\u{1}'..='\u{1f}' | '\u{7f}' => {
                escaped.push_str(&format!("\\{:x} ", ch as u32));
            }
            '0'..='9' if at_start => escaped.push_str(&format!("\\{:x} ", ch as u32)),
            '-' if first && chars.peek().is_none() => escaped.push_str("\\-"),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || !c.is_ascii() => {
                escaped.push(c)
            }
            c => {
                escaped.push('\\');
                escaped.push(c);
            }
        }
        leading_dash = first && ch == '-';
        first = false;
    }
    escaped
}

static SENSITIVE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(pass(word|wd)?|e-?mail|secret|token|otp|cc-(number|csc))").ok()
});

/// Password and email fields never keep their value.
pub fn is_sensitive(target: &TargetInfo) -> bool {
    if matches!(target.input_type.as_deref(), Some("password" | "email")) {
        return true;
    }
    let Some(pattern) = SENSITIVE.as_ref() else {
        return false;
    };
    [target.name.as_deref(), target.autocomplete.as_deref(), target.id.as_deref()]
        .into_iter()
        .flatten()
        .any(|attribute| pattern.is_match(attribute))
}

fn clip(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut clipped: String = value.chars().take(max_chars).collect();
    clipped.push('…');
    clipped
}
