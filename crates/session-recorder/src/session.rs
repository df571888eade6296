//! Recording sessions.
//!
//! A session is one recording lifecycle of a tab: `start_session` subscribes to the tab, takes a
//! `Recording` reference on the shared inspection attachment, injects the page observer and
//! spawns the pump; `stop_session` stops the pump, releases the reference and correlates the
//! buffers into a [`SessionReport`]. When the tab disappears mid-recording the pump tears the
//! session down itself and parks a partial report for the next `stop_session`. Whichever side
//! removes the session from the active map performs the release, so it happens exactly once.

use std::sync::{Arc, Weak};

use bugtrail_core_types::{SessionId, TabId, Timeline};
use bugtrail_event_bus::{EventBus, InMemoryBus};
use cdp_adapter::{Feature, InspectionManager};
use dashmap::DashMap;
use network_tap::{NetworkSnapshot, NetworkTap};
use page_observers::{observer_script, PageObservers};
use serde::{Deserialize, Serialize};
use serde_json::json;
use timeline::{Correlator, RawBuffers, RecordingWindow};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RecorderConfig;
use crate::errors::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::hub::BackendHub;
use crate::pump::{Pump, PumpExit};

const TARGET: &str = "session-recorder";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session: SessionId,
    pub tab: TabId,
    pub started_at_ms: u64,
}

/// The outcome of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session: SessionId,
    pub tab: TabId,
    pub started_at_ms: u64,
    pub stopped_at_ms: u64,
    /// The tab went away before the session was stopped.
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSnapshot>,
    pub timeline: Timeline,
}

struct ActiveSession {
    handle: SessionHandle,
    stop: CancellationToken,
    pump: JoinHandle<Option<RawBuffers>>,
}

pub struct SessionManager {
    cfg: RecorderConfig,
    inspection: Arc<InspectionManager>,
    tap: Arc<NetworkTap>,
    observers: Arc<PageObservers>,
    script: String,
    correlator: Correlator,
    clock: Arc<dyn Clock>,
    hub: Option<Arc<BackendHub>>,
    bus: Option<Arc<InMemoryBus<SessionEvent>>>,
    sessions: DashMap<TabId, ActiveSession>,
    aborted: DashMap<TabId, SessionReport>,
    /// Serializes start and stop calls.
    lifecycle: Mutex<()>,
}

pub struct SessionManagerBuilder {
    inspection: Arc<InspectionManager>,
    cfg: RecorderConfig,
    correlator: Correlator,
    clock: Arc<dyn Clock>,
    hub: Option<Arc<BackendHub>>,
    bus: Option<Arc<InMemoryBus<SessionEvent>>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, cfg: RecorderConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn correlator(mut self, correlator: Correlator) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hub(mut self, hub: Arc<BackendHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn bus(mut self, bus: Arc<InMemoryBus<SessionEvent>>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Arc<SessionManager> {
        let script = observer_script(&self.cfg.observer);
        Arc::new(SessionManager {
            tap: Arc::new(NetworkTap::with_config(self.cfg.tap.clone())),
            observers: Arc::new(PageObservers::new(self.cfg.observer.clone())),
            script,
            cfg: self.cfg,
            inspection: self.inspection,
            correlator: self.correlator,
            clock: self.clock,
            hub: self.hub,
            bus: self.bus,
            sessions: DashMap::new(),
            aborted: DashMap::new(),
            lifecycle: Mutex::new(()),
        })
    }
}

impl SessionManager {
    pub fn builder(inspection: Arc<InspectionManager>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            inspection,
            cfg: RecorderConfig::default(),
            correlator: Correlator::default(),
            clock: Arc::new(SystemClock),
            hub: None,
            bus: None,
        }
    }

    pub fn inspection(&self) -> &Arc<InspectionManager> {
        &self.inspection
    }

    pub fn is_recording(&self, tab: &TabId) -> bool {
        self.sessions.contains_key(tab)
    }

    pub fn active_sessions(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.tab.cmp(&b.tab));
        handles
    }

    /// Starts recording `tab`. Fails without side effects when the inspection channel cannot be
    /// acquired.
    pub async fn start_session(self: &Arc<Self>, tab: &TabId) -> SessionResult<SessionHandle> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.sessions.contains_key(tab) {
            return Err(SessionError::AlreadyRecording(tab.clone()));
        }
        self.aborted.remove(tab);

        let started_at_ms = self.clock.now_ms();
        let subscription = self.inspection.subscribe(tab);
        self.tap.enable(tab);
        if let Err(err) = self.inspection.acquire(tab, Feature::Recording).await {
            let _ = self.tap.disable(tab);
            warn!(target: TARGET, %tab, %err, "session could not start");
            return Err(err.into());
        }
        if !self.cfg.skip_observer_injection {
            self.install_observer(tab).await;
        }

        let backend = self.hub.as_ref().map(|hub| {
            let feed = hub.subscribe_logs();
            hub.begin_recording();
            feed
        });

        let handle = SessionHandle {
            session: SessionId::new(),
            tab: tab.clone(),
            started_at_ms,
        };
        let stop = CancellationToken::new();
        let pump = Pump::new(
            tab.clone(),
            handle.session,
            started_at_ms,
            Arc::clone(&self.clock),
            Arc::clone(&self.tap),
            Arc::clone(&self.observers),
        );
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let manager = Arc::downgrade(self);
        let task_handle = handle.clone();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            // The session must be registered before the pump can claim it.
            let _ = ready_rx.await;
            let (raw, exit) = pump.run(subscription, backend, task_stop.clone()).await;
            match exit {
                PumpExit::TabGone => abort_if_claimed(manager, &task_handle, raw, task_stop).await,
                PumpExit::Stopped => Some(raw),
            }
        });

        self.sessions.insert(
            tab.clone(),
            ActiveSession {
                handle: handle.clone(),
                stop,
                pump: task,
            },
        );
        let _ = ready_tx.send(());

        info!(target: TARGET, %tab, session = %handle.session, "recording started");
        self.publish(SessionEvent::Started {
            session: handle.session,
            tab: tab.clone(),
            started_at_ms,
        })
        .await;
        Ok(handle)
    }

    /// Stops recording `tab` and returns its report. A session aborted by tab closure returns
    /// its partial report once.
    pub async fn stop_session(&self, tab: &TabId) -> SessionResult<SessionReport> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some((_, active)) = self.sessions.remove(tab) else {
            return self
                .aborted
                .remove(tab)
                .map(|(_, report)| report)
                .ok_or_else(|| SessionError::NotRecording(tab.clone()));
        };

        active.stop.cancel();
        let raw = match active.pump.await {
            Ok(Some(raw)) => raw,
            Ok(None) => RawBuffers::default(),
            Err(err) => {
                warn!(target: TARGET, %tab, %err, "session pump failed; report will be empty");
                RawBuffers::default()
            }
        };
        let stopped_at_ms = self.clock.now_ms();
        let network = self.teardown(tab).await;

        let report = self.report(active.handle, stopped_at_ms, raw, network, false);
        info!(
            target: TARGET,
            %tab,
            session = %report.session,
            events = report.timeline.events.len(),
            key_issues = report.timeline.key_issues.len(),
            "recording stopped"
        );
        self.publish(SessionEvent::Stopped {
            session: report.session,
            tab: tab.clone(),
            summary: report.timeline.summary.clone(),
        })
        .await;
        Ok(report)
    }

    /// Stops every active session, returning the reports in tab order.
    pub async fn stop_all(&self) -> Vec<SessionReport> {
        let mut tabs: Vec<TabId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        tabs.sort();
        let mut reports = Vec::with_capacity(tabs.len());
        for tab in tabs {
            match self.stop_session(&tab).await {
                Ok(report) => reports.push(report),
                Err(err) => debug!(target: TARGET, %tab, %err, "session already gone"),
            }
        }
        reports
    }

    async fn install_observer(&self, tab: &TabId) {
        let commands = [
            (
                "Runtime.addBinding",
                json!({ "name": self.observers.binding_name() }),
            ),
            (
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": self.script }),
            ),
            (
                "Runtime.evaluate",
                json!({ "expression": self.script, "silent": true }),
            ),
        ];
        for (method, params) in commands {
            if let Err(err) = self.inspection.send(tab, method, params).await {
                warn!(target: TARGET, %tab, method, %err, "observer injection incomplete");
            }
        }
    }

    /// Releases everything a session holds. Runs once per session, with the lifecycle lock held.
    async fn teardown(&self, tab: &TabId) -> Option<NetworkSnapshot> {
        let released = self.inspection.release(tab, Feature::Recording).await;
        debug!(target: TARGET, %tab, released, "recording reference released");
        if let Some(hub) = &self.hub {
            hub.end_recording();
        }
        self.tap.disable(tab).ok()
    }

    fn report(
        &self,
        handle: SessionHandle,
        stopped_at_ms: u64,
        mut raw: RawBuffers,
        network: Option<NetworkSnapshot>,
        aborted: bool,
    ) -> SessionReport {
        raw.window = Some(RecordingWindow {
            started_at_ms: handle.started_at_ms,
            stopped_at_ms: stopped_at_ms.max(handle.started_at_ms),
        });
        SessionReport {
            timeline: self.correlator.correlate(&raw),
            session: handle.session,
            tab: handle.tab,
            started_at_ms: handle.started_at_ms,
            stopped_at_ms,
            aborted,
            network,
        }
    }

    async fn abort(&self, handle: &SessionHandle, raw: RawBuffers) {
        let stopped_at_ms = self.clock.now_ms();
        let network = self.teardown(&handle.tab).await;
        let report = self.report(handle.clone(), stopped_at_ms, raw, network, true);
        warn!(
            target: TARGET,
            tab = %handle.tab,
            session = %handle.session,
            events = report.timeline.events.len(),
            "recording aborted: tab closed"
        );
        let summary = report.timeline.summary.clone();
        self.aborted.insert(handle.tab.clone(), report);
        self.publish(SessionEvent::Aborted {
            session: handle.session,
            tab: handle.tab.clone(),
            summary,
        })
        .await;
    }

    async fn publish(&self, event: SessionEvent) {
        if let Some(bus) = &self.bus {
            // Nobody listening is fine.
            let _ = bus.publish(event).await;
        }
    }
}

/// Tears the session down from the pump side if it is still registered. Returns the buffers
/// back when `stop_session` got there first.
async fn abort_if_claimed(
    manager: Weak<SessionManager>,
    handle: &SessionHandle,
    raw: RawBuffers,
    stop: CancellationToken,
) -> Option<RawBuffers> {
    let Some(manager) = manager.upgrade() else {
        return Some(raw);
    };
    // A stop in progress holds the lifecycle lock and waits for this task; it cancels `stop`
    // first, so waiting on both cannot deadlock.
    let _lifecycle = tokio::select! {
        guard = manager.lifecycle.lock() => guard,
        _ = stop.cancelled() => return Some(raw),
    };
    let claimed = manager
        .sessions
        .remove_if(&handle.tab, |_, active| active.handle.session == handle.session)
        .is_some();
    if !claimed {
        return Some(raw);
    }
    manager.abort(handle, raw).await;
    None
}
