use std::fs;
use std::path::Path;

use bugtrail_core_types::{Event, EventKind};
use serde::{Deserialize, Serialize};

use crate::errors::TlResult;

/// Wall-clock bounds of a recording. When present the timeline is framed by start/end markers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingWindow {
    pub started_at_ms: u64,
    pub stopped_at_ms: u64,
}

impl RecordingWindow {
    pub fn duration_ms(&self) -> u64 {
        self.stopped_at_ms.saturating_sub(self.started_at_ms)
    }
}

/// The per-source event buffers of one session, in the order each source emitted them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBuffers {
    pub window: Option<RecordingWindow>,
    pub network: Vec<Event>,
    pub console: Vec<Event>,
    pub interaction: Vec<Event>,
    pub backend: Vec<Event>,
}

impl RawBuffers {
    /// Appends an event to the buffer of its source. Markers are derived from `window` and are
    /// not buffered.
    pub fn push(&mut self, event: Event) {
        match event.kind {
            EventKind::Network => self.network.push(event),
            EventKind::ConsoleLog | EventKind::ConsoleWarning | EventKind::ConsoleError => {
                self.console.push(event)
            }
            EventKind::UserInteraction => self.interaction.push(event),
            EventKind::BackendLog | EventKind::BackendWarn | EventKind::BackendError => {
                self.backend.push(event)
            }
            EventKind::RecordingStart | EventKind::RecordingEnd => {}
        }
    }

    pub fn len(&self) -> usize {
        self.network.len() + self.console.len() + self.interaction.len() + self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads buffers from JSON. Accepts either the buffer object itself or a flat array of
    /// events, which is split by source.
    pub fn from_json(raw: &str) -> TlResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.is_array() {
            let events: Vec<Event> = serde_json::from_value(value)?;
            let mut buffers = RawBuffers::default();
            for event in events {
                buffers.push(event);
            }
            return Ok(buffers);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn load(path: impl AsRef<Path>) -> TlResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
