//! The per-session event pump.
//!
//! One task per session owns the raw buffers. It drains the tab's protocol subscription and the
//! hub's backend feed, runs each event through its adapter and appends the result to the buffer
//! of its source. Nothing else mutates the buffers while the session runs.

use std::sync::Arc;

use bugtrail_core_types::{BackendPayload, Event, EventKind, SessionId, TabId};
use cdp_adapter::{TabSubscription, TransportEvent};
use network_tap::{NetworkTap, TapEvent};
use page_observers::PageObservers;
use timeline::RawBuffers;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::hub::BackendLogEntry;

const TARGET: &str = "session-recorder";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PumpExit {
    Stopped,
    TabGone,
}

#[derive(Clone, Copy)]
enum Source {
    Network = 0,
    Console = 1,
    Interaction = 2,
    Backend = 3,
}

impl Source {
    fn of(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Network => Some(Source::Network),
            EventKind::ConsoleLog | EventKind::ConsoleWarning | EventKind::ConsoleError => {
                Some(Source::Console)
            }
            EventKind::UserInteraction => Some(Source::Interaction),
            EventKind::BackendLog | EventKind::BackendWarn | EventKind::BackendError => {
                Some(Source::Backend)
            }
            EventKind::RecordingStart | EventKind::RecordingEnd => None,
        }
    }
}

pub(crate) struct Pump {
    pub(crate) tab: TabId,
    pub(crate) session: SessionId,
    pub(crate) started_at_ms: u64,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tap: Arc<NetworkTap>,
    pub(crate) observers: Arc<PageObservers>,
    raw: RawBuffers,
    /// Latest relative time per source; each buffer stays non-decreasing.
    last_relative: [u64; 4],
}

impl Pump {
    pub(crate) fn new(
        tab: TabId,
        session: SessionId,
        started_at_ms: u64,
        clock: Arc<dyn Clock>,
        tap: Arc<NetworkTap>,
        observers: Arc<PageObservers>,
    ) -> Self {
        Self {
            tab,
            session,
            started_at_ms,
            clock,
            tap,
            observers,
            raw: RawBuffers::default(),
            last_relative: [0; 4],
        }
    }

    pub(crate) async fn run(
        mut self,
        mut subscription: TabSubscription,
        mut backend: Option<broadcast::Receiver<BackendLogEntry>>,
        stop: CancellationToken,
    ) -> (RawBuffers, PumpExit) {
        let exit = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    while let Some(event) = subscription.try_recv() {
                        self.on_protocol_event(event);
                    }
                    if let Some(rx) = backend.as_mut() {
                        self.drain_backend(rx);
                    }
                    break PumpExit::Stopped;
                }
                event = subscription.recv() => match event {
                    Some(event) => self.on_protocol_event(event),
                    None => {
                        info!(target: TARGET, tab = %self.tab, session = %self.session, "tab gone during recording");
                        break PumpExit::TabGone;
                    }
                },
                entry = next_backend(&mut backend) => match entry {
                    Some(entry) => self.on_backend(entry),
                    None => backend = None,
                },
            }
        };
        (self.raw, exit)
    }

    pub(crate) fn on_protocol_event(&mut self, event: TransportEvent) {
        let timestamp_ms = self.clock.now_ms();
        let relative_ms = timestamp_ms.saturating_sub(self.started_at_ms);
        let method = event.method.as_str();

        if method.starts_with("Network.") {
            let tap_event = match TapEvent::from_cdp(method, &event.params) {
                Ok(Some(tap_event)) => tap_event,
                Ok(None) => return,
                Err(err) => {
                    warn!(target: TARGET, tab = %self.tab, %err, "dropping malformed network event");
                    return;
                }
            };
            match self
                .tap
                .ingest(&self.tab, tap_event, timestamp_ms, relative_ms)
            {
                Ok(Some(converted)) => self.push(converted),
                Ok(None) => {}
                Err(err) => debug!(target: TARGET, tab = %self.tab, %err, "network tap refused event"),
            }
            return;
        }

        if PageObservers::handles(method) {
            match self
                .observers
                .ingest(method, &event.params, timestamp_ms, relative_ms)
            {
                Ok(Some(converted)) => self.push(converted),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: TARGET, tab = %self.tab, %err, "dropping malformed page event")
                }
            }
            return;
        }

        trace!(target: TARGET, tab = %self.tab, method, "event not recorded");
    }

    pub(crate) fn on_backend(&mut self, entry: BackendLogEntry) {
        let record = entry.record;
        let relative_ms = record.timestamp.saturating_sub(self.started_at_ms);
        let stack = record
            .stack
            .as_deref()
            .map(|stack| {
                stack
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.push(Event::backend(
            record.timestamp,
            relative_ms,
            record.message,
            BackendPayload {
                level: record.level,
                server_port: entry.server_port,
                stack,
            },
        ));
    }

    /// Takes every backend record already fanned out, without waiting for more.
    fn drain_backend(&mut self, rx: &mut broadcast::Receiver<BackendLogEntry>) {
        loop {
            match rx.try_recv() {
                Ok(entry) => self.on_backend(entry),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(target: TARGET, skipped, "backend log feed lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn push(&mut self, mut event: Event) {
        if let Some(source) = Source::of(event.kind) {
            let last = &mut self.last_relative[source as usize];
            event.relative_ms = event.relative_ms.max(*last);
            *last = event.relative_ms;
        }
        self.raw.push(event);
    }

    #[cfg(test)]
    pub(crate) fn buffers(&self) -> &RawBuffers {
        &self.raw
    }
}

async fn next_backend(
    backend: &mut Option<broadcast::Receiver<BackendLogEntry>>,
) -> Option<BackendLogEntry> {
    let Some(rx) = backend.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(entry) => return Some(entry),
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: TARGET, skipped, "backend log feed lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use bugtrail_core_types::{BackendLevel, LogRecord};
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;

    fn pump(clock: Arc<ManualClock>) -> Pump {
        let tap = Arc::new(NetworkTap::new());
        let tab = TabId::from("T1");
        tap.enable(&tab);
        Pump::new(
            tab,
            SessionId::new(),
            T0,
            clock,
            tap,
            Arc::new(PageObservers::default()),
        )
    }

    fn cdp(method: &str, params: serde_json::Value) -> TransportEvent {
        TransportEvent::new(method, params, Some("S1".into()))
    }

    #[test]
    fn routes_network_and_console_events_to_their_buffers() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let mut pump = pump(clock.clone());

        clock.advance(100);
        pump.on_protocol_event(cdp(
            "Network.requestWillBeSent",
            json!({ "requestId": "r1", "request": { "url": "/api/data", "method": "GET" } }),
        ));
        clock.advance(50);
        pump.on_protocol_event(cdp(
            "Network.loadingFailed",
            json!({ "requestId": "r1", "errorText": "net::ERR_CONNECTION_REFUSED", "canceled": false }),
        ));
        pump.on_protocol_event(cdp(
            "Runtime.consoleAPICalled",
            json!({ "type": "warn", "args": [{ "type": "string", "value": "slow" }] }),
        ));
        pump.on_protocol_event(cdp("Page.frameNavigated", json!({})));

        let raw = pump.buffers();
        assert_eq!(raw.network.len(), 1);
        assert_eq!(raw.network[0].relative_ms, 150);
        assert!(raw.network[0].is_network_failure());
        assert_eq!(raw.console.len(), 1);
        assert_eq!(raw.console[0].kind, EventKind::ConsoleWarning);
    }

    #[test]
    fn malformed_events_are_dropped() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let mut pump = pump(clock);
        pump.on_protocol_event(cdp("Runtime.exceptionThrown", json!({})));
        pump.on_protocol_event(cdp("Network.responseReceived", json!({})));
        assert!(pump.buffers().is_empty());
    }

    #[test]
    fn backend_records_are_relative_to_session_start_and_monotonic() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let mut pump = pump(clock);
        let entry = |offset: u64, message: &str| BackendLogEntry {
            server_port: Some(3000),
            record: LogRecord {
                level: BackendLevel::Error,
                message: message.into(),
                timestamp: T0 + offset,
                stack: Some("at a\n  at b\n".into()),
            },
        };
        pump.on_backend(entry(300, "first"));
        pump.on_backend(entry(200, "skewed"));

        let backend = &pump.buffers().backend;
        assert_eq!(backend[0].relative_ms, 300);
        assert_eq!(backend[1].relative_ms, 300);
        match &backend[0].payload {
            bugtrail_core_types::EventPayload::Backend(payload) => {
                assert_eq!(payload.stack, vec!["at a", "at b"]);
                assert_eq!(payload.server_port, Some(3000));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_keeps_backend_records_already_fanned_out() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let pump = pump(clock);
        let router = cdp_adapter::router::EventRouter::new();
        let subscription = router.subscribe(&pump.tab, 8);
        let (logs, feed) = broadcast::channel(8);
        for (offset, message) in [(20, "pool exhausted"), (30, "request aborted")] {
            logs.send(BackendLogEntry {
                server_port: Some(3000),
                record: LogRecord {
                    level: BackendLevel::Error,
                    message: message.into(),
                    timestamp: T0 + offset,
                    stack: None,
                },
            })
            .unwrap();
        }
        let stop = CancellationToken::new();
        stop.cancel();

        let (raw, exit) = pump.run(subscription, Some(feed), stop).await;
        assert_eq!(exit, PumpExit::Stopped);
        let messages: Vec<&str> = raw.backend.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["pool exhausted", "request aborted"]);
    }
}
