//! Backend log hub.
//!
//! Observed server processes connect here with a backend log client. The hub keeps one slot per
//! connection, tells every client to start forwarding when the first recording session begins
//! and to stop when the last one ends, and fans the incoming log records out to the sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bugtrail_core_types::{ClientFrame, LogRecord, ServerFrame};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;

const TARGET: &str = "backend-hub";

/// One log record as received from an observed process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendLogEntry {
    pub server_port: Option<u16>,
    pub record: LogRecord,
}

struct ClientSlot {
    server_port: Option<u16>,
    outbox: mpsc::UnboundedSender<ServerFrame>,
}

pub struct BackendHub {
    cfg: HubConfig,
    clients: DashMap<u64, ClientSlot>,
    next_client: AtomicU64,
    /// Number of active recording sessions. Held while broadcasting recording frames so a
    /// registering client cannot miss a transition.
    active: Mutex<usize>,
    capture_stdout: bool,
    logs: broadcast::Sender<BackendLogEntry>,
    closing: CancellationToken,
}

impl BackendHub {
    pub fn new(cfg: HubConfig) -> Arc<Self> {
        Self::with_capture(cfg, false)
    }

    /// A hub that also asks clients for debug/trace output.
    pub fn with_capture(cfg: HubConfig, capture_stdout: bool) -> Arc<Self> {
        let (logs, _) = broadcast::channel(cfg.fanout_capacity.max(1));
        Arc::new(Self {
            cfg,
            clients: DashMap::new(),
            next_client: AtomicU64::new(1),
            active: Mutex::new(0),
            capture_stdout,
            logs,
            closing: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    /// Receives every log record forwarded while a recording is active.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<BackendLogEntry> {
        self.logs.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn registered_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .clients
            .iter()
            .filter_map(|slot| slot.server_port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_recording(&self) -> bool {
        *self.active.lock() > 0
    }

    /// Marks one more session as recording. The first one starts every client.
    pub fn begin_recording(&self) {
        let mut active = self.active.lock();
        *active += 1;
        if *active == 1 {
            info!(target: TARGET, clients = self.clients.len(), "starting backend recording");
            self.broadcast(ServerFrame::StartRecording {
                capture_stdout: self.capture_stdout,
            });
        }
    }

    /// Marks one session as finished. The last one stops every client.
    pub fn end_recording(&self) {
        let mut active = self.active.lock();
        if *active == 0 {
            return;
        }
        *active -= 1;
        if *active == 0 {
            info!(target: TARGET, "stopping backend recording");
            self.broadcast(ServerFrame::StopRecording);
        }
    }

    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(self.cfg.websocket_path.as_str(), get(websocket_handler))
            .route(self.cfg.health_path.as_str(), get(health_handler))
            .with_state(Arc::clone(self))
    }

    /// Serves the hub on `listener` until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(target: TARGET, %addr, path = %self.cfg.websocket_path, "backend log hub listening");
        let hub = Arc::clone(&self);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                hub.close();
            })
            .await
    }

    pub(crate) fn connect_client(&self) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::unbounded_channel();
        self.clients.insert(
            id,
            ClientSlot {
                server_port: None,
                outbox,
            },
        );
        debug!(target: TARGET, client = id, "client connected");
        (id, rx)
    }

    pub(crate) fn disconnect_client(&self, id: u64) {
        if let Some((_, slot)) = self.clients.remove(&id) {
            debug!(target: TARGET, client = id, port = ?slot.server_port, "client disconnected");
        }
    }

    /// Applies one text frame from client `id`.
    pub(crate) fn on_client_text(&self, id: u64, text: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: TARGET, client = id, ?err, "ignoring unreadable client frame");
                return;
            }
        };
        match frame {
            ClientFrame::Register { server_port } => {
                let active = self.active.lock();
                let outbox = self.clients.get_mut(&id).map(|mut slot| {
                    slot.server_port = Some(server_port);
                    slot.outbox.clone()
                });
                info!(target: TARGET, client = id, server_port, "client registered");
                if let (Some(outbox), true) = (outbox, *active > 0) {
                    let _ = outbox.send(ServerFrame::StartRecording {
                        capture_stdout: self.capture_stdout,
                    });
                }
            }
            ClientFrame::Log(record) => {
                if !self.is_recording() {
                    trace!(target: TARGET, client = id, "log outside recording dropped");
                    return;
                }
                let server_port = self.clients.get(&id).and_then(|slot| slot.server_port);
                // No session listening is not an error.
                let _ = self.logs.send(BackendLogEntry {
                    server_port,
                    record,
                });
            }
            ClientFrame::Pong => trace!(target: TARGET, client = id, "pong"),
        }
    }

    fn broadcast(&self, frame: ServerFrame) {
        for slot in self.clients.iter() {
            if slot.outbox.send(frame.clone()).is_err() {
                debug!(target: TARGET, client = *slot.key(), "client outbox closed");
            }
        }
    }
}

async fn websocket_handler(
    State(hub): State<Arc<BackendHub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(hub, socket))
}

async fn health_handler(State(hub): State<Arc<BackendHub>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": hub.client_count(),
        "ports": hub.registered_ports(),
        "recording": hub.is_recording(),
    }))
}

async fn handle_socket(hub: Arc<BackendHub>, mut socket: WebSocket) {
    let (id, mut outbox) = hub.connect_client();
    let mut heartbeat = tokio::time::interval(hub.cfg.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = hub.closing.cancelled() => break,
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut socket, &ServerFrame::Ping).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => hub.on_client_text(id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: TARGET, client = id, ?err, "client socket error");
                    break;
                }
            },
        }
    }
    hub.disconnect_client(id);
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(target: TARGET, ?err, "frame encoding failed");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugtrail_core_types::BackendLevel;

    fn log_frame(message: &str) -> String {
        serde_json::to_string(&ClientFrame::Log(LogRecord {
            level: BackendLevel::Error,
            message: message.into(),
            timestamp: 1,
            stack: None,
        }))
        .unwrap()
    }

    #[test]
    fn first_session_starts_and_last_session_stops_clients() {
        let hub = BackendHub::new(HubConfig::default());
        let (_, mut rx) = hub.connect_client();

        hub.begin_recording();
        hub.begin_recording();
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerFrame::StartRecording {
                capture_stdout: false
            }
        );
        assert!(rx.try_recv().is_err());

        hub.end_recording();
        assert!(rx.try_recv().is_err());
        hub.end_recording();
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::StopRecording);

        hub.end_recording();
        assert!(!hub.is_recording());
    }

    #[test]
    fn late_registration_is_started_immediately() {
        let hub = BackendHub::with_capture(HubConfig::default(), true);
        hub.begin_recording();
        let (id, mut rx) = hub.connect_client();
        hub.on_client_text(id, r#"{"type":"register","serverPort":8080}"#);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerFrame::StartRecording {
                capture_stdout: true
            }
        );
        assert_eq!(hub.registered_ports(), vec![8080]);
    }

    #[test]
    fn logs_fan_out_only_while_recording() {
        let hub = BackendHub::new(HubConfig::default());
        let mut logs = hub.subscribe_logs();
        let (id, _rx) = hub.connect_client();
        hub.on_client_text(id, r#"{"type":"register","serverPort":3000}"#);

        hub.on_client_text(id, &log_frame("too early"));
        assert!(logs.try_recv().is_err());

        hub.begin_recording();
        hub.on_client_text(id, &log_frame("db down"));
        let entry = logs.try_recv().unwrap();
        assert_eq!(entry.server_port, Some(3000));
        assert_eq!(entry.record.message, "db down");
    }

    #[test]
    fn garbage_frames_and_disconnects_are_tolerated() {
        let hub = BackendHub::new(HubConfig::default());
        let (id, _rx) = hub.connect_client();
        hub.on_client_text(id, "not json");
        assert_eq!(hub.client_count(), 1);
        hub.disconnect_client(id);
        hub.disconnect_client(id);
        assert_eq!(hub.client_count(), 0);
    }
}
