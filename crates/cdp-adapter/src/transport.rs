//! Raw DevTools connection.
//!
//! The [`CdpTransport`] trait is the seam between the attachment layer and a concrete browser
//! connection. [`ChromiumTransport`] drives a chromiumoxide [`Connection`] on a background task;
//! tests substitute scripted transports.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::extract_ws_url;

/// One protocol event as received from the browser. `session_id` is set for events emitted on an
/// attached (flattened) target session.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl TransportEvent {
    pub fn new(method: impl Into<String>, params: Value, session_id: Option<String>) -> Self {
        Self {
            method: method.into(),
            params,
            session_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    /// Next event from the browser; `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;
}

#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, AdapterError> {
        Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("no browser connection for {method}")))
    }
}

type LinkFactory =
    Arc<dyn Fn(CdpConfig) -> BoxFuture<'static, Result<Arc<Link>, AdapterError>> + Send + Sync>;

type Pending = HashMap<CallId, oneshot::Sender<Result<Value, AdapterError>>>;

/// Transport backed by a real Chromium process or an existing DevTools endpoint.
///
/// The underlying link is created lazily and recreated when its background task has died.
#[derive(Clone)]
pub struct ChromiumTransport {
    cfg: CdpConfig,
    link: Arc<Mutex<Option<Arc<Link>>>>,
    factory: LinkFactory,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        let factory: LinkFactory =
            Arc::new(|cfg: CdpConfig| Box::pin(async move { Link::open(cfg).await.map(Arc::new) }));
        Self {
            cfg,
            link: Arc::new(Mutex::new(None)),
            factory,
        }
    }

    async fn link(&self) -> Result<Arc<Link>, AdapterError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_alive() {
                return Ok(link.clone());
            }
            debug!(target: "cdp-transport", "devtools link is dead; reopening");
        }
        let link = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(link.clone());
        Ok(link)
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }

    #[cfg(test)]
    fn with_factory(cfg: CdpConfig, factory: LinkFactory) -> Self {
        Self {
            cfg,
            link: Arc::new(Mutex::new(None)),
            factory,
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let link = self.link().await?;
        // Target lifecycle events drive tab-closed detection; attaching stays explicit per tab.
        link.call(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            json!({ "discover": true }),
            self.deadline(),
        )
        .await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.link().await {
            Ok(link) => link.next_event().await,
            Err(err) => {
                warn!(target: "cdp-transport", %err, "devtools link unavailable");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let link = self.link().await?;
        link.call(target, method, params, self.deadline()).await
    }
}

struct Call {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, AdapterError>>,
}

/// A live DevTools websocket plus the tasks pumping it.
struct Link {
    calls: mpsc::Sender<Call>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl Link {
    async fn open(cfg: CdpConfig) -> Result<Self, AdapterError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => {
                let (child, url) = launch(&cfg).await?;
                (Some(child), url)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(map_cdp_error)?;

        let (calls_tx, calls_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let alive = Arc::new(AtomicBool::new(true));

        let pump_alive = alive.clone();
        let pump = tokio::spawn(async move {
            if let Err(err) = pump_connection(conn, calls_rx, events_tx).await {
                error!(target: "cdp-transport", %err, "devtools connection failed");
            }
            pump_alive.store(false, Ordering::Relaxed);
        });

        let heartbeat = spawn_heartbeat(
            calls_tx.clone(),
            alive.clone(),
            Duration::from_millis(cfg.heartbeat_interval_ms),
        );

        info!(target: "cdp-transport", url = %ws_url, "connected to browser");

        Ok(Self {
            calls: calls_tx,
            events: Mutex::new(events_rx),
            pump,
            heartbeat,
            child: Mutex::new(child),
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(Call {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| {
                AdapterError::new(AdapterErrorKind::CdpIo).with_hint("devtools link closed")
            })?;

        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("{method}: connection dropped before reply"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::CommandTimeout)
                .with_hint(format!("{method} timed out after {}ms", deadline.as_millis()))
                .retriable(true)),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    #[cfg(test)]
    fn stub() -> (Arc<Self>, Arc<AtomicBool>) {
        let (calls, _calls_rx) = mpsc::channel(1);
        let (_events_tx, events_rx) = mpsc::channel(1);
        let alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(futures::future::pending::<()>());
        let link = Arc::new(Self {
            calls,
            events: Mutex::new(events_rx),
            pump,
            heartbeat: None,
            child: Mutex::new(None),
            alive: alive.clone(),
        });
        (link, alive)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.pump.abort();
        if let Some(handle) = &self.heartbeat {
            handle.abort();
        }
        let Ok(mut guard) = self.child.try_lock() else {
            return;
        };
        let Some(mut child) = guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to stop browser process");
                    }
                });
            }
            Err(_) => {
                debug!(target: "cdp-transport", "no runtime left to stop browser process");
            }
        }
    }
}

async fn pump_connection(
    mut conn: Connection<CdpEventMessage>,
    mut calls: mpsc::Receiver<Call>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut pending: Pending = HashMap::new();

    loop {
        tokio::select! {
            Some(call) = calls.recv() => {
                let session = match call.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
                };
                let method: MethodId = call.method.into();
                match conn.submit_command(method, session, call.params) {
                    Ok(id) => {
                        pending.insert(id, call.reply);
                    }
                    // Only this call's parameters failed to encode; the link stays up.
                    Err(err) => {
                        let _ = call.reply.send(Err(submit_error(&err)));
                    }
                }
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(reply) = pending.remove(&resp.id) {
                        let _ = reply.send(response_payload(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => {
                    let raw: CdpJsonEventMessage = match event.try_into() {
                        Ok(raw) => raw,
                        Err(err) => {
                            debug!(target: "cdp-transport", ?err, "undecodable event skipped");
                            continue;
                        }
                    };
                    let event = TransportEvent {
                        method: raw.method.into_owned(),
                        params: raw.params,
                        session_id: raw.session_id,
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(err)) => {
                    let err = map_cdp_error(err);
                    fail_pending(&mut pending, &err);
                    return Err(err);
                }
                None => {
                    let err = AdapterError::new(AdapterErrorKind::CdpIo)
                        .with_hint("browser closed the devtools connection");
                    fail_pending(&mut pending, &err);
                    return Ok(());
                }
            }
        }
    }
}

fn fail_pending(pending: &mut Pending, err: &AdapterError) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(err.clone()));
    }
}

fn response_payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))
            .with_data(json!({ "code": error.code }))),
        (None, None) => Ok(Value::Object(Default::default())),
    }
}

fn submit_error(err: &serde_json::Error) -> AdapterError {
    AdapterError::new(AdapterErrorKind::Internal)
        .with_hint(format!("command could not be encoded: {err}"))
}

fn map_cdp_error(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::CommandTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_) | CdpError::JavascriptException(_) | CdpError::FrameNotFound(_) => {
            AdapterError::new(AdapterErrorKind::Internal).with_hint(hint)
        }
        _ => AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}

fn spawn_heartbeat(
    calls: mpsc::Sender<Call>,
    alive: Arc<AtomicBool>,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    let patience = every.min(Duration::from_secs(5));

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            let (reply, response) = oneshot::channel();
            let beat = Call {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".into(),
                params: json!({}),
                reply,
            };
            if calls.send(beat).await.is_err() {
                break;
            }
            match tokio::time::timeout(patience, response).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(target: "cdp-transport", %err, "heartbeat rejected");
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(target: "cdp-transport", "heartbeat timed out");
                    alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }))
}

async fn launch(cfg: &CdpConfig) -> Result<(Child, String), AdapterError> {
    let browser = browser_config(cfg)?;
    let mut child = browser.launch().map_err(|err| {
        AdapterError::new(AdapterErrorKind::CdpIo).with_hint(format!("failed to launch browser: {err}"))
    })?;
    let ws_url = extract_ws_url(&mut child)
        .await
        .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;
    Ok((child, ws_url))
}

fn browser_config(cfg: &CdpConfig) -> Result<BrowserConfig, AdapterError> {
    if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!(
                "browser executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set BUGTRAIL_CHROME to the full path of chrome/chromium."
            })));
    }

    let profile = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        std::env::current_dir()
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("cannot resolve working directory: {err}"))
            })?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("cannot create profile dir {}: {err}", profile.display()))
    })?;

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_secs(20))
        .user_data_dir(profile);

    if !cfg.headless {
        builder = builder.with_head();
    }

    let mut args = vec![
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-background-networking",
        "--disable-component-update",
        "--remote-allow-origins=*",
    ];
    if cfg.headless {
        args.push("--headless=new");
    }
    builder = builder.args(args);

    if !cfg.executable.as_os_str().is_empty() {
        builder = builder.chrome_executable(cfg.executable.clone());
    }

    builder.build().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal).with_hint(format!("browser config: {err}"))
    })
}
