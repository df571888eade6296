use std::fmt;

use bugtrail_core_types::BackendLevel;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::client::BackendLogClient;

/// Targets never forwarded: the client itself and the socket stack underneath it.
const OWN_TARGETS: &[&str] = &[
    "backend-log-client",
    "backend_log_client",
    "tokio_tungstenite",
    "tungstenite",
];

/// Forwards the observed process's `tracing` events to the hub while a recording is active.
///
/// `INFO` and above are always forwarded; `DEBUG`/`TRACE` only when the hub asked for
/// `captureStdout`.
#[derive(Clone)]
pub struct BackendLogLayer {
    client: BackendLogClient,
}

impl BackendLogLayer {
    pub fn new(client: BackendLogClient) -> Self {
        Self { client }
    }
}

impl<S> Layer<S> for BackendLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_own_target(meta.target()) || !self.client.is_recording() {
            return;
        }
        let level = match *meta.level() {
            Level::ERROR => BackendLevel::Error,
            Level::WARN => BackendLevel::Warn,
            Level::INFO => BackendLevel::Log,
            _ if self.client.captures_stdout() => BackendLevel::Log,
            _ => return,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.client.record(level, visitor.finish(), None);
    }
}

fn is_own_target(target: &str) -> bool {
    OWN_TARGETS.iter().any(|own| target.starts_with(own))
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {}", self.message, fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
