use bugtrail_core_types::{SessionId, Summary, TabId};

/// Lifecycle notifications published on the session bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        session: SessionId,
        tab: TabId,
        started_at_ms: u64,
    },
    Stopped {
        session: SessionId,
        tab: TabId,
        summary: Summary,
    },
    /// The tab went away mid-recording; the partial report waits for `stop_session`.
    Aborted {
        session: SessionId,
        tab: TabId,
        summary: Summary,
    },
}

impl SessionEvent {
    pub fn tab(&self) -> &TabId {
        match self {
            SessionEvent::Started { tab, .. }
            | SessionEvent::Stopped { tab, .. }
            | SessionEvent::Aborted { tab, .. } => tab,
        }
    }
}
