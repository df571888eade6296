use bugtrail_core_types::{Event, EventPayload, Severity};

use crate::policy::CorrelatorPolicy;

const ELLIPSIS: char = '…';

pub fn normalize(mut event: Event, policy: &CorrelatorPolicy) -> Event {
    if event.kind.is_console() {
        let unstyled = strip_style_markers(&event.message);
        event.message = truncate(&unstyled, policy.message_cap);
    }
    if event.severity != Severity::Error {
        match &mut event.payload {
            EventPayload::Console(console) => console.stack.clear(),
            EventPayload::Backend(backend) => backend.stack.clear(),
            _ => {}
        }
    }
    event
}

/// Removes `%c` directives; their CSS arguments are already dropped when the message is built.
pub fn strip_style_markers(message: &str) -> String {
    if !message.contains("%c") {
        return message.to_string();
    }
    let stripped = message.replace("%c", "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keeps the first `cap` characters and appends an ellipsis when anything was cut.
pub fn truncate(message: &str, cap: usize) -> String {
    match message.char_indices().nth(cap) {
        Some((cut, _)) => {
            let mut out = message[..cut].to_string();
            out.push(ELLIPSIS);
            out
        }
        None => message.to_string(),
    }
}
