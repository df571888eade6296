use bugtrail_core_types::Event;

/// Collapses runs of adjacent events with the same kind and message where each event follows the
/// previous one by at most `window_ms`. The run keeps its first event's times; its message gains
/// a ` ×N` suffix and `repeat_count` holds N.
///
/// Input must already be sorted by relative time.
pub fn collapse(events: Vec<Event>, window_ms: u64) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    // Relative time of the newest member of the current run.
    let mut run_tail_ms = 0u64;

    for event in events {
        if let Some(head) = out.last_mut() {
            let same = head.kind == event.kind && head.message == event.message;
            if same && event.relative_ms.saturating_sub(run_tail_ms) <= window_ms {
                head.repeat_count = head.repeat_count.saturating_add(event.repeat_count);
                run_tail_ms = event.relative_ms;
                continue;
            }
        }
        run_tail_ms = event.relative_ms;
        out.push(event);
    }

    for event in out.iter_mut().filter(|event| event.repeat_count > 1) {
        event.message = format!("{} ×{}", event.message, event.repeat_count);
    }
    out
}
