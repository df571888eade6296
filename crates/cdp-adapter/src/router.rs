//! Per-tab event routing.
//!
//! Maps CDP session ids onto tabs and fans every event of a tab out to the subscribers registered
//! for that tab. Subscribers of one tab never see another tab's traffic.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use bugtrail_core_types::TabId;

use crate::metrics;
use crate::transport::TransportEvent;

/// Receiving half of a tab subscription. The stream ends when the tab is released for the last
/// time or its target goes away.
#[derive(Debug)]
pub struct TabSubscription {
    pub tab: TabId,
    rx: mpsc::Receiver<TransportEvent>,
}

impl TabSubscription {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct EventRouter {
    sessions: DashMap<String, TabId>,
    subscribers: DashMap<TabId, Vec<mpsc::Sender<TransportEvent>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, tab: &TabId, buffer: usize) -> TabSubscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.entry(tab.clone()).or_default().push(tx);
        TabSubscription {
            tab: tab.clone(),
            rx,
        }
    }

    pub fn bind(&self, cdp_session: &str, tab: &TabId) {
        self.sessions.insert(cdp_session.to_string(), tab.clone());
    }

    pub fn unbind(&self, cdp_session: &str) {
        self.sessions.remove(cdp_session);
    }

    pub fn tab_for(&self, cdp_session: &str) -> Option<TabId> {
        self.sessions.get(cdp_session).map(|entry| entry.clone())
    }

    /// Drops every subscriber of the tab, ending their streams.
    pub fn close_tab(&self, tab: &TabId) {
        self.subscribers.remove(tab);
    }

    pub fn subscriber_count(&self, tab: &TabId) -> usize {
        self.subscribers
            .get(tab)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Routes a session-scoped event. Returns the tab it was routed to, if any.
    pub fn route(&self, event: &TransportEvent) -> Option<TabId> {
        let session = event.session_id.as_deref()?;
        let tab = self.tab_for(session)?;
        self.deliver(&tab, event);
        Some(tab)
    }

    /// Delivers an event to every live subscriber of `tab`. Full queues drop the event for that
    /// subscriber; closed receivers are pruned.
    pub fn deliver(&self, tab: &TabId, event: &TransportEvent) {
        let Some(mut subs) = self.subscribers.get_mut(tab) else {
            trace!(target: "cdp-adapter", %tab, method = %event.method, "no subscribers");
            return;
        };
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                metrics::record_event_routed();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_event_dropped();
                warn!(
                    target: "cdp-adapter",
                    %tab,
                    method = %event.method,
                    "subscriber queue full; event dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(session: &str, method: &str) -> TransportEvent {
        TransportEvent::new(method, json!({}), Some(session.to_string()))
    }

    #[tokio::test]
    async fn routes_only_to_bound_tab() {
        let router = EventRouter::new();
        let a = TabId::from("A");
        let b = TabId::from("B");
        let mut sub_a = router.subscribe(&a, 8);
        let mut sub_b = router.subscribe(&b, 8);
        router.bind("s-a", &a);
        router.bind("s-b", &b);

        assert_eq!(router.route(&event("s-a", "Log.entryAdded")), Some(a.clone()));
        assert_eq!(sub_a.recv().await.unwrap().method, "Log.entryAdded");
        assert!(sub_b.try_recv().is_none());

        assert!(router.route(&event("s-unknown", "Log.entryAdded")).is_none());
    }

    #[tokio::test]
    async fn closing_tab_ends_streams() {
        let router = EventRouter::new();
        let tab = TabId::from("T");
        let mut sub = router.subscribe(&tab, 4);
        router.close_tab(&tab);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn full_queue_drops_without_unsubscribing() {
        let router = EventRouter::new();
        let tab = TabId::from("T");
        let mut sub = router.subscribe(&tab, 1);
        router.bind("s", &tab);
        router.route(&event("s", "first"));
        router.route(&event("s", "second"));
        assert_eq!(router.subscriber_count(&tab), 1);
        assert_eq!(sub.try_recv().unwrap().method, "first");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let router = EventRouter::new();
        let tab = TabId::from("T");
        let sub = router.subscribe(&tab, 1);
        drop(sub);
        router.deliver(&tab, &event("s", "x"));
        assert_eq!(router.subscriber_count(&tab), 0);
    }
}
