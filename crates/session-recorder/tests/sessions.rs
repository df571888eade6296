use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bugtrail_core_types::{EventKind, KeyIssueKind, TabId};
use bugtrail_event_bus::{EventBus, InMemoryBus};
use cdp_adapter::{
    AdapterError, AdapterErrorKind, CdpConfig, CdpTransport, CommandTarget, Feature,
    InspectionManager, TransportEvent,
};
use futures_util::SinkExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use session_recorder::{
    BackendHub, HubConfig, ManualClock, SessionError, SessionEvent, SessionManager, Viewport,
    ViewportEmulation,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const T0: u64 = 1_700_000_000_000;

struct MockTransport {
    commands: SyncMutex<Vec<(CommandTarget, String, Value)>>,
    failures: SyncMutex<HashMap<String, usize>>,
    sessions: AtomicUsize,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            commands: SyncMutex::new(Vec::new()),
            failures: SyncMutex::new(HashMap::new()),
            sessions: AtomicUsize::new(0),
            events_tx,
            events_rx: Mutex::new(events_rx),
        })
    }

    fn fail(&self, method: &str, times: usize) {
        self.failures.lock().insert(method.to_string(), times);
    }

    fn count(&self, method: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|(_, name, _)| name == method)
            .count()
    }

    fn params_of(&self, method: &str) -> Option<Value> {
        self.commands
            .lock()
            .iter()
            .rev()
            .find(|(_, name, _)| name == method)
            .map(|(_, _, params)| params.clone())
    }

    /// Emits an event on the first attached session.
    fn emit(&self, method: &str, params: Value) {
        self.events_tx
            .send(TransportEvent::new(method, params, Some("S1".into())))
            .unwrap();
    }

    fn emit_browser(&self, method: &str, params: Value) {
        self.events_tx
            .send(TransportEvent::new(method, params, None))
            .unwrap();
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        tokio::task::yield_now().await;
        self.commands
            .lock()
            .push((target, method.to_string(), params));
        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(method) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AdapterError::new(AdapterErrorKind::CdpIo)
                        .with_hint(format!("scripted failure for {method}")));
                }
            }
        }
        match method {
            "Target.attachToTarget" => {
                let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "sessionId": format!("S{n}") }))
            }
            _ => Ok(json!({})),
        }
    }
}

struct Rig {
    transport: Arc<MockTransport>,
    inspection: Arc<InspectionManager>,
    clock: Arc<ManualClock>,
    bus: Arc<InMemoryBus<SessionEvent>>,
    hub: Arc<BackendHub>,
    manager: Arc<SessionManager>,
}

async fn rig() -> Rig {
    let transport = MockTransport::new();
    let inspection = InspectionManager::new(CdpConfig::default(), transport.clone());
    inspection.start().await.unwrap();
    let clock = Arc::new(ManualClock::starting_at(T0));
    let bus = InMemoryBus::new(32);
    let hub = BackendHub::new(HubConfig::default());
    let manager = SessionManager::builder(inspection.clone())
        .clock(clock.clone())
        .bus(bus.clone())
        .hub(hub.clone())
        .build();
    Rig {
        transport,
        inspection,
        clock,
        bus,
        hub,
        manager,
    }
}

/// Lets the routing loop and the session pump catch up.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn recording_produces_a_framed_correlated_timeline() {
    let rig = rig().await;
    let tab = TabId::from("T1");

    let handle = rig.manager.start_session(&tab).await.unwrap();
    assert_eq!(handle.started_at_ms, T0);
    assert!(rig.manager.is_recording(&tab));
    assert!(rig.inspection.holds(&tab, Feature::Recording));
    assert!(rig.hub.is_recording());
    assert_eq!(rig.transport.count("Runtime.addBinding"), 1);
    assert_eq!(
        rig.transport.params_of("Runtime.addBinding").unwrap()["name"],
        "__bugtrailReport"
    );

    rig.clock.advance(100);
    rig.transport.emit(
        "Network.requestWillBeSent",
        json!({ "requestId": "r1", "request": { "url": "http://localhost:3000/api/orders", "method": "POST" } }),
    );
    settle().await;
    rig.clock.advance(40);
    rig.transport.emit(
        "Network.loadingFailed",
        json!({ "requestId": "r1", "errorText": "net::ERR_CONNECTION_REFUSED", "canceled": false }),
    );
    settle().await;
    rig.clock.advance(60);
    rig.transport.emit(
        "Runtime.consoleAPICalled",
        json!({ "type": "error", "args": [{ "type": "string", "value": "checkout failed" }] }),
    );
    settle().await;
    rig.clock.advance(300);

    let report = rig.manager.stop_session(&tab).await.unwrap();
    assert!(!report.aborted);
    assert_eq!(report.session, handle.session);
    assert_eq!(report.stopped_at_ms, T0 + 500);

    let events = &report.timeline.events;
    assert_eq!(events.first().unwrap().kind, EventKind::RecordingStart);
    assert_eq!(events.last().unwrap().kind, EventKind::RecordingEnd);
    assert_eq!(events.last().unwrap().relative_ms, 500);
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::RecordingStart,
            EventKind::Network,
            EventKind::ConsoleError,
            EventKind::RecordingEnd,
        ]
    );
    assert_eq!(events[1].relative_ms, 140);
    assert_eq!(events[2].relative_ms, 200);
    assert_eq!(events[2].message, "checkout failed");

    assert_eq!(report.timeline.summary.network_failures, 1);
    assert_eq!(report.timeline.summary.console_errors, 1);
    let root = report.timeline.root_cause().unwrap();
    assert_eq!(root.kind, KeyIssueKind::NetworkFailure);
    assert_eq!(report.network.as_ref().unwrap().failed, 1);

    assert!(!rig.manager.is_recording(&tab));
    assert!(!rig.inspection.is_attached(&tab));
    assert!(!rig.hub.is_recording());
    assert_eq!(rig.transport.count("Target.detachFromTarget"), 1);
}

#[tokio::test]
async fn failed_start_leaves_nothing_behind() {
    let rig = rig().await;
    let tab = TabId::from("T1");
    rig.transport.fail("Target.attachToTarget", 1);

    let err = rig.manager.start_session(&tab).await.unwrap_err();
    assert!(matches!(err, SessionError::Inspection(_)));
    assert!(!rig.manager.is_recording(&tab));
    assert!(rig.manager.active_sessions().is_empty());
    assert!(!rig.hub.is_recording());
    assert_eq!(rig.inspection.ref_count(&tab), 0);

    rig.manager.start_session(&tab).await.unwrap();
    assert!(rig.manager.is_recording(&tab));
}

#[tokio::test]
async fn double_start_and_stray_stop_are_rejected() {
    let rig = rig().await;
    let tab = TabId::from("T1");

    assert!(matches!(
        rig.manager.stop_session(&tab).await,
        Err(SessionError::NotRecording(_))
    ));

    rig.manager.start_session(&tab).await.unwrap();
    assert!(matches!(
        rig.manager.start_session(&tab).await,
        Err(SessionError::AlreadyRecording(_))
    ));
    assert_eq!(rig.transport.count("Target.attachToTarget"), 1);

    rig.manager.stop_session(&tab).await.unwrap();
    assert!(matches!(
        rig.manager.stop_session(&tab).await,
        Err(SessionError::NotRecording(_))
    ));
}

#[tokio::test]
async fn closed_tab_aborts_once_and_parks_the_partial_report() {
    let rig = rig().await;
    let mut events = rig.bus.subscribe();
    let tab = TabId::from("T1");
    rig.manager.start_session(&tab).await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), SessionEvent::Started { .. }));

    rig.clock.advance(20);
    rig.transport.emit(
        "Runtime.consoleAPICalled",
        json!({ "type": "warn", "args": [{ "type": "string", "value": "about to close" }] }),
    );
    settle().await;
    rig.clock.advance(30);
    rig.transport
        .emit_browser("Target.targetDestroyed", json!({ "targetId": "T1" }));

    let aborted = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match aborted {
        SessionEvent::Aborted { tab: gone, summary, .. } => {
            assert_eq!(gone, tab);
            assert_eq!(summary.console_warnings, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!rig.manager.is_recording(&tab));
    assert!(!rig.hub.is_recording());
    // The target is gone; nothing is detached or disabled on it.
    assert_eq!(rig.transport.count("Target.detachFromTarget"), 0);
    assert_eq!(rig.transport.count("Network.disable"), 0);

    let report = rig.manager.stop_session(&tab).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.stopped_at_ms, T0 + 50);
    assert_eq!(report.timeline.summary.console_warnings, 1);
    assert!(matches!(
        rig.manager.stop_session(&tab).await,
        Err(SessionError::NotRecording(_))
    ));

    // The tab can be recorded again once it is back.
    rig.manager.start_session(&tab).await.unwrap();
    assert!(rig.manager.is_recording(&tab));
}

#[tokio::test]
async fn viewport_and_recording_share_the_attachment() {
    let rig = rig().await;
    let tab = TabId::from("T1");
    let viewport = ViewportEmulation::new(rig.inspection.clone());

    viewport
        .apply(&tab, Viewport::mobile(390, 844, 3.0))
        .await
        .unwrap();
    rig.manager.start_session(&tab).await.unwrap();
    assert_eq!(rig.transport.count("Target.attachToTarget"), 1);
    assert_eq!(rig.inspection.ref_count(&tab), 2);
    let params = rig
        .transport
        .params_of("Emulation.setDeviceMetricsOverride")
        .unwrap();
    assert_eq!(params["width"], 390);
    assert_eq!(params["mobile"], true);

    rig.manager.stop_session(&tab).await.unwrap();
    assert!(rig.inspection.is_attached(&tab));
    assert!(viewport.is_active(&tab));
    assert_eq!(rig.transport.count("Target.detachFromTarget"), 0);

    assert!(viewport.clear(&tab).await);
    assert!(!rig.inspection.is_attached(&tab));
    assert_eq!(rig.transport.count("Emulation.clearDeviceMetricsOverride"), 1);
    assert_eq!(rig.transport.count("Target.detachFromTarget"), 1);
    assert!(!viewport.clear(&tab).await);
}

#[tokio::test]
async fn failed_viewport_override_releases_its_reference() {
    let rig = rig().await;
    let tab = TabId::from("T1");
    let viewport = ViewportEmulation::new(rig.inspection.clone());
    rig.transport.fail("Emulation.setDeviceMetricsOverride", 1);

    assert!(viewport
        .apply(&tab, Viewport::desktop(1280, 720))
        .await
        .is_err());
    assert!(!viewport.is_active(&tab));
    assert!(!rig.inspection.is_attached(&tab));
}

#[tokio::test]
async fn stop_all_reports_every_tab_in_order() {
    let rig = rig().await;
    let a = TabId::from("A");
    let b = TabId::from("B");
    rig.manager.start_session(&b).await.unwrap();
    rig.manager.start_session(&a).await.unwrap();
    assert_eq!(
        rig.manager
            .active_sessions()
            .iter()
            .map(|handle| handle.tab.clone())
            .collect::<Vec<_>>(),
        vec![a.clone(), b.clone()]
    );

    let reports = rig.manager.stop_all().await;
    assert_eq!(
        reports.iter().map(|report| report.tab.clone()).collect::<Vec<_>>(),
        vec![a, b]
    );
    assert!(!rig.hub.is_recording());
    assert!(rig.manager.active_sessions().is_empty());
}

#[tokio::test]
async fn backend_log_arriving_just_before_stop_is_kept() {
    let rig = rig().await;
    let tab = TabId::from("T1");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(rig.hub.clone().serve(listener, shutdown.clone()));

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/__bugtrail/backend"))
            .await
            .unwrap();
    socket
        .send(Message::Text(
            json!({ "type": "register", "serverPort": 3000 }).to_string(),
        ))
        .await
        .unwrap();

    rig.manager.start_session(&tab).await.unwrap();
    let mut logs = rig.hub.subscribe_logs();
    socket
        .send(Message::Text(
            json!({ "type": "log", "level": "error", "message": "db connection refused", "timestamp": T0 + 80 })
                .to_string(),
        ))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), logs.recv())
        .await
        .unwrap()
        .unwrap();

    let report = rig.manager.stop_session(&tab).await.unwrap();
    let backend: Vec<_> = report
        .timeline
        .events
        .iter()
        .filter(|event| event.kind == EventKind::BackendError)
        .collect();
    assert_eq!(backend.len(), 1);
    assert_eq!(backend[0].message, "db connection refused");
    assert_eq!(backend[0].relative_ms, 80);

    shutdown.cancel();
}

