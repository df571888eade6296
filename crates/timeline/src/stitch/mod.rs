//! The correlation pipeline, one stage per module.

pub mod dedup;
pub mod filter;
pub mod issues;
pub mod normalize;

use bugtrail_core_types::{Event, EventKind, Timeline};

use crate::model::RawBuffers;
use crate::policy::CorrelatorPolicy;

/// Runs every stage over `raw`.
pub fn build(raw: &RawBuffers, policy: &CorrelatorPolicy) -> Timeline {
    // Fixed source order keeps equal-time ties deterministic.
    let sources = [&raw.network, &raw.console, &raw.interaction, &raw.backend];
    let mut merged: Vec<Event> = sources
        .into_iter()
        .flat_map(|buffer| buffer.iter())
        .filter(|event| filter::keep(event, policy))
        .cloned()
        .map(|event| normalize::normalize(event, policy))
        .collect();

    merged.sort_by_key(|event| event.relative_ms);
    let mut events = dedup::collapse(merged, policy.dedup_window_ms);

    let summary = issues::summarize(&events);
    let key_issues = issues::key_issues(&events);

    if let Some(window) = raw.window {
        events.insert(
            0,
            Event::marker(EventKind::RecordingStart, window.started_at_ms, 0),
        );
        let end_rel = window
            .duration_ms()
            .max(events.last().map(|event| event.relative_ms).unwrap_or(0));
        events.push(Event::marker(
            EventKind::RecordingEnd,
            window.stopped_at_ms,
            end_rel,
        ));
    }

    Timeline {
        events,
        summary,
        key_issues,
    }
}
