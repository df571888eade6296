//! The reconnecting client.
//!
//! One background task owns the socket. Producers (the tracing layer, the panic hook, direct
//! [`BackendLogClient::record`] calls) only push into the ring buffer and wake that task, so
//! recording never blocks the observed process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bugtrail_core_types::{now_ms, BackendLevel, ClientFrame, LogRecord, ServerFrame};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::ClientResult;
use crate::layer::BackendLogLayer;
use crate::state::{Backoff, ClientState, RingBuffer};
use crate::transport::{Connection, Connector, Scheduler, TokioScheduler, WsConnector};

const TARGET: &str = "backend-log-client";

#[derive(Clone)]
pub struct BackendLogClient {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: ClientConfig,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<ClientState>,
    recording: AtomicBool,
    capture_stdout: AtomicBool,
    buffer: Mutex<RingBuffer>,
    wake: Notify,
    cancel: CancellationToken,
    disabled_logged: AtomicBool,
}

impl BackendLogClient {
    pub fn new(cfg: ClientConfig) -> Self {
        Self::with_parts(cfg, Arc::new(WsConnector), Arc::new(TokioScheduler))
    }

    pub fn with_parts(
        cfg: ClientConfig,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let buffer = RingBuffer::new(cfg.buffer_capacity);
        Self {
            inner: Arc::new(Inner {
                cfg,
                connector,
                scheduler,
                state: Mutex::new(ClientState::Disconnected),
                recording: AtomicBool::new(false),
                capture_stdout: AtomicBool::new(false),
                buffer: Mutex::new(buffer),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                disabled_logged: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the connection task on the current tokio runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// A tracing layer forwarding the process's own events through this client.
    pub fn layer(&self) -> BackendLogLayer {
        BackendLogLayer::new(self.clone())
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::Acquire)
    }

    /// Whether the hub asked for debug/trace output as well.
    pub fn captures_stdout(&self) -> bool {
        self.inner.capture_stdout.load(Ordering::Acquire)
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.buffer.lock().dropped()
    }

    /// Queues one record for the hub. Returns false when the record was swallowed because no
    /// recording is active or the client is disabled.
    pub fn record(
        &self,
        level: BackendLevel,
        message: impl Into<String>,
        stack: Option<String>,
    ) -> bool {
        if !self.is_recording() || self.state() == ClientState::Disabled {
            return false;
        }
        self.inner.buffer.lock().push(LogRecord {
            level,
            message: message.into(),
            timestamp: now_ms(),
            stack,
        });
        self.inner.wake.notify_one();
        true
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Connect, serve and reconnect until shut down or disabled.
    pub async fn run(&self) {
        let cfg = &self.inner.cfg;
        let cancel = self.inner.cancel.clone();
        let mut backoff = Backoff::new(cfg.base_backoff(), cfg.max_backoff(), cfg.max_attempts);

        loop {
            if cancel.is_cancelled() {
                self.set_state(ClientState::Disconnected);
                return;
            }
            self.set_state(ClientState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ClientState::Disconnected);
                    return;
                }
                result = self.inner.connector.connect(&cfg.hub_url) => result,
            };

            match connected {
                Ok(conn) => {
                    backoff.reset();
                    info!(target: TARGET, url = %cfg.hub_url, "connected to backend log hub");
                    self.serve(conn).await;
                    debug!(target: TARGET, "hub connection closed");
                }
                Err(err) => {
                    debug!(target: TARGET, ?err, attempt = backoff.attempts(), "hub connect failed");
                }
            }
            self.set_state(ClientState::Disconnected);
            if cancel.is_cancelled() {
                return;
            }

            let Some(delay) = backoff.next_delay() else {
                self.disable(backoff.attempts());
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.inner.scheduler.sleep(delay) => {}
            }
        }
    }

    async fn serve(&self, mut conn: Box<dyn Connection>) {
        let register = ClientFrame::Register {
            server_port: self.inner.cfg.server_port,
        };
        if let Err(err) = send_frame(conn.as_mut(), &register).await {
            debug!(target: TARGET, ?err, "registration failed");
            return;
        }
        self.set_state(ClientState::Connected {
            recording: self.is_recording(),
        });

        loop {
            if !self.flush(conn.as_mut()).await {
                return;
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = self.inner.wake.notified() => {}
                incoming = conn.recv() => match incoming {
                    Some(Ok(text)) => {
                        if !self.on_frame(conn.as_mut(), &text).await {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(target: TARGET, ?err, "hub socket error");
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    /// Sends everything buffered. Returns false when the socket failed.
    async fn flush(&self, conn: &mut dyn Connection) -> bool {
        loop {
            let Some(record) = self.inner.buffer.lock().pop() else {
                return true;
            };
            let frame = ClientFrame::Log(record);
            if let Err(err) = send_frame(conn, &frame).await {
                debug!(target: TARGET, ?err, "log send failed; keeping record");
                if let ClientFrame::Log(record) = frame {
                    self.inner.buffer.lock().requeue(record);
                }
                return false;
            }
        }
    }

    async fn on_frame(&self, conn: &mut dyn Connection, text: &str) -> bool {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: TARGET, ?err, "ignoring unreadable hub frame");
                return true;
            }
        };
        match frame {
            ServerFrame::StartRecording { capture_stdout } => {
                self.inner
                    .capture_stdout
                    .store(capture_stdout, Ordering::Release);
                self.inner.recording.store(true, Ordering::Release);
                self.set_state(ClientState::Connected { recording: true });
                info!(target: TARGET, capture_stdout, "recording started");
                true
            }
            ServerFrame::StopRecording => {
                self.inner.recording.store(false, Ordering::Release);
                self.set_state(ClientState::Connected { recording: false });
                info!(target: TARGET, "recording stopped");
                true
            }
            ServerFrame::Ping => match send_frame(conn, &ClientFrame::Pong).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(target: TARGET, ?err, "pong failed");
                    false
                }
            },
        }
    }

    fn disable(&self, attempts: u32) {
        self.set_state(ClientState::Disabled);
        self.inner.recording.store(false, Ordering::Release);
        if !self.inner.disabled_logged.swap(true, Ordering::AcqRel) {
            warn!(
                target: TARGET,
                attempts,
                url = %self.inner.cfg.hub_url,
                "backend log hub unreachable; backend logging disabled"
            );
        }
    }

    fn set_state(&self, next: ClientState) {
        let mut state = self.inner.state.lock();
        if *state != ClientState::Disabled {
            *state = next;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_recording(&self, capture_stdout: bool) {
        self.inner
            .capture_stdout
            .store(capture_stdout, Ordering::Release);
        self.inner.recording.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn drain(&self) -> Vec<LogRecord> {
        let mut buffer = self.inner.buffer.lock();
        std::iter::from_fn(|| buffer.pop()).collect()
    }
}

async fn send_frame(conn: &mut dyn Connection, frame: &ClientFrame) -> ClientResult<()> {
    let text = serde_json::to_string(frame)?;
    conn.send(text).await
}
