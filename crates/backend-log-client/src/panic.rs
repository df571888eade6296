use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, Location};

use bugtrail_core_types::BackendLevel;

use crate::client::BackendLogClient;

/// Frames forwarded with a panic.
pub const PANIC_FRAMES: usize = 3;

/// Frames from these prefixes are panic machinery, not the faulting code.
const RUNTIME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "<alloc::",
    "<core::",
    "<std::",
    "rust_begin_unwind",
    "__rust",
    "backend_log_client::panic",
];

/// Chains a hook that reports panics as `error` records, then defers to the previous hook.
pub fn install_panic_hook(client: BackendLogClient) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let message = describe(info.payload(), info.location());
        let frames = top_frames(&Backtrace::force_capture().to_string(), PANIC_FRAMES);
        let stack = (!frames.is_empty()).then(|| frames.join("\n"));
        client.record(BackendLevel::Error, message, stack);
        previous(info);
    }));
}

fn describe(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string());
    match location {
        Some(location) => format!(
            "panicked at {}:{}:{}: {text}",
            location.file(),
            location.line(),
            location.column()
        ),
        None => format!("panicked: {text}"),
    }
}

/// First `limit` application frames of a rendered backtrace, as `symbol (at file:line:col)`.
pub fn top_frames(rendered: &str, limit: usize) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(symbol) = current.take() {
                frames.push(format!("{symbol} (at {location})"));
            }
            continue;
        }
        let Some((index, symbol)) = trimmed.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Some(previous) = current.take() {
            frames.push(previous);
        }
        if !RUNTIME_PREFIXES.iter().any(|prefix| symbol.starts_with(prefix)) {
            current = Some(symbol.to_string());
        }
    }
    if let Some(last) = current {
        frames.push(last);
    }
    frames.truncate(limit);
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:312:9
   1: backend_log_client::panic::install_panic_hook::{{closure}}
             at ./src/panic.rs:30:22
   2: std::panicking::rust_panic_with_hook
   3: app::orders::load
             at ./src/orders.rs:42:5
   4: app::handlers::get_orders
             at ./src/handlers.rs:10:9
   5: <F as axum::handler::Handler>::call
   6: app::main
             at ./src/main.rs:3:1
";

    #[test]
    fn keeps_first_three_application_frames() {
        assert_eq!(
            top_frames(RENDERED, 3),
            vec![
                "app::orders::load (at ./src/orders.rs:42:5)".to_string(),
                "app::handlers::get_orders (at ./src/handlers.rs:10:9)".to_string(),
                "<F as axum::handler::Handler>::call".to_string(),
            ]
        );
    }

    #[test]
    fn empty_backtrace_yields_nothing() {
        assert!(top_frames("disabled backtrace", 3).is_empty());
    }

    #[test]
    fn describes_str_and_string_payloads() {
        let location = Location::caller();
        let text = describe(&"index out of bounds", Some(location));
        assert!(text.starts_with("panicked at "));
        assert!(text.ends_with(": index out of bounds"));
        assert_eq!(describe(&String::from("bad"), None), "panicked: bad");
        assert_eq!(describe(&42u8, None), "panicked: Box<dyn Any>");
    }
}
