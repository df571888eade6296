use bugtrail_core_types::{Event, EventPayload};

use crate::policy::CorrelatorPolicy;

/// False for the recorder's own traffic: console output from its injected instrumentation,
/// requests to its control endpoints and ignored methods such as CORS preflights.
pub fn keep(event: &Event, policy: &CorrelatorPolicy) -> bool {
    match &event.payload {
        EventPayload::Console(console) => {
            let own_url = console
                .url
                .as_deref()
                .map(|url| has_prefix(url, &policy.self_source_prefixes))
                .unwrap_or(false);
            let own_stack = console
                .stack
                .iter()
                .any(|frame| mentions(frame, &policy.self_source_prefixes));
            !(own_url || own_stack)
        }
        EventPayload::Network(net) => {
            let ignored_method = policy
                .ignored_methods
                .iter()
                .any(|method| method.eq_ignore_ascii_case(&net.method));
            let own_endpoint = policy
                .self_endpoints
                .iter()
                .any(|endpoint| net.url.contains(endpoint.as_str()));
            !(ignored_method || own_endpoint)
        }
        _ => true,
    }
}

fn has_prefix(value: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| value.starts_with(prefix.as_str()))
}

// Stack frames are rendered as "fn (url:line:col)", so the prefix can sit anywhere.
fn mentions(frame: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| frame.contains(prefix.as_str()))
}
