use bugtrail_core_types::Timeline;
use tracing::debug;

use crate::model::RawBuffers;
use crate::policy::CorrelatorPolicy;
use crate::stitch;

/// Correlates raw session buffers under an explicit policy.
pub fn correlate(raw: &RawBuffers, policy: &CorrelatorPolicy) -> Timeline {
    let timeline = stitch::build(raw, policy);
    debug!(
        target: "timeline",
        raw = raw.len(),
        events = timeline.events.len(),
        key_issues = timeline.key_issues.len(),
        "timeline correlated"
    );
    timeline
}

/// Correlator carrying the policy every session it finishes is correlated under.
#[derive(Clone, Debug, Default)]
pub struct Correlator {
    policy: CorrelatorPolicy,
}

impl Correlator {
    pub fn with_policy(policy: CorrelatorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CorrelatorPolicy {
        &self.policy
    }

    pub fn correlate(&self, raw: &RawBuffers) -> Timeline {
        correlate(raw, &self.policy)
    }
}
