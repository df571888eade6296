//! Shared, reference-counted inspection attachments.
//!
//! A tab is physically attached at most once no matter how many features use it. Each
//! [`Feature`] holds at most one reference; the CDP session is detached when the last reference is
//! released. Acquire and release for the same tab are serialized so a concurrent acquire and
//! release never race into a double attach or a premature detach.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bugtrail_core_types::TabId;

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;
use crate::router::{EventRouter, TabSubscription};
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

const MIN_RESTART_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Protocol domains a feature may need enabled on its tab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Domain {
    Network,
    Log,
    Runtime,
}

impl Domain {
    pub fn enable_method(&self) -> &'static str {
        match self {
            Domain::Network => "Network.enable",
            Domain::Log => "Log.enable",
            Domain::Runtime => "Runtime.enable",
        }
    }

    pub fn disable_method(&self) -> &'static str {
        match self {
            Domain::Network => "Network.disable",
            Domain::Log => "Log.disable",
            Domain::Runtime => "Runtime.disable",
        }
    }
}

/// A consumer of a tab's inspection channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Recording,
    ViewportEmulation,
}

impl Feature {
    pub fn domains(&self) -> &'static [Domain] {
        match self {
            Feature::Recording => &[Domain::Network, Domain::Log, Domain::Runtime],
            Feature::ViewportEmulation => &[],
        }
    }
}

#[derive(Clone, Debug)]
struct TabAttachment {
    cdp_session: String,
    features: BTreeSet<Feature>,
}

impl TabAttachment {
    fn domains(&self) -> BTreeSet<Domain> {
        self.features
            .iter()
            .flat_map(|feature| feature.domains().iter().copied())
            .collect()
    }
}

/// A page target as reported by the browser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub tab: TabId,
    pub url: String,
    pub title: String,
}

pub struct InspectionManager {
    cfg: CdpConfig,
    transport: Arc<dyn CdpTransport>,
    router: EventRouter,
    locks: DashMap<TabId, Arc<Mutex<()>>>,
    attachments: DashMap<TabId, TabAttachment>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl InspectionManager {
    pub fn new(cfg: CdpConfig, transport: Arc<dyn CdpTransport>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            router: EventRouter::new(),
            locks: DashMap::new(),
            attachments: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Starts the transport and the event routing loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), AdapterError> {
        self.transport.start().await?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.event_loop().await });
        self.tasks.lock().push(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(target: "cdp-adapter", ?err, "event loop ended abnormally");
                }
            }
        }
    }

    /// Takes a reference on `tab` for `feature`, attaching and enabling domains as needed.
    ///
    /// Acquiring a feature that already holds a reference is a no-op. On failure nothing is left
    /// behind: a freshly created attachment is detached and domains enabled by this call are
    /// disabled again.
    pub async fn acquire(&self, tab: &TabId, feature: Feature) -> Result<(), AdapterError> {
        let lock = self.tab_lock(tab);
        let _guard = lock.lock().await;

        let existing = self.attachments.get(tab).map(|entry| entry.clone());
        if let Some(current) = &existing {
            if current.features.contains(&feature) {
                debug!(target: "cdp-adapter", %tab, ?feature, "feature already holds tab");
                return Ok(());
            }
        }

        let (cdp_session, fresh) = match &existing {
            Some(current) => (current.cdp_session.clone(), false),
            None => {
                let session = self.attach(tab).await?;
                self.router.bind(&session, tab);
                (session, true)
            }
        };

        let active = existing
            .as_ref()
            .map(TabAttachment::domains)
            .unwrap_or_default();
        let mut enabled = Vec::new();
        for domain in feature.domains() {
            if active.contains(domain) {
                continue;
            }
            match self
                .command(&cdp_session, domain.enable_method(), json!({}))
                .await
            {
                Ok(_) => enabled.push(*domain),
                Err(err) => {
                    warn!(
                        target: "cdp-adapter",
                        %tab,
                        method = domain.enable_method(),
                        %err,
                        "enable failed; rolling back"
                    );
                    self.rollback(tab, &cdp_session, &enabled, fresh).await;
                    return Err(err);
                }
            }
        }

        // The target may have disappeared while commands were in flight.
        if self.router.tab_for(&cdp_session).is_none() {
            return Err(AdapterError::new(AdapterErrorKind::TargetGone)
                .with_hint(format!("tab {tab} closed during attach")));
        }

        match self.attachments.get_mut(tab) {
            Some(mut current) => {
                current.features.insert(feature);
            }
            None if fresh => {
                self.attachments.insert(
                    tab.clone(),
                    TabAttachment {
                        cdp_session,
                        features: BTreeSet::from([feature]),
                    },
                );
            }
            None => {
                return Err(AdapterError::new(AdapterErrorKind::TargetGone)
                    .with_hint(format!("tab {tab} closed during acquire")));
            }
        }
        info!(target: "cdp-adapter", %tab, ?feature, refs = self.ref_count(tab), "feature acquired");
        Ok(())
    }

    /// Drops `feature`'s reference on `tab`. Returns `true` when this released the last reference
    /// and the tab was detached.
    ///
    /// Releasing a feature that holds no reference is a no-op. Disable and detach failures are
    /// logged and swallowed; the reference is gone either way.
    pub async fn release(&self, tab: &TabId, feature: Feature) -> bool {
        let lock = self.tab_lock(tab);
        let _guard = lock.lock().await;

        let Some(current) = self.attachments.get(tab).map(|entry| entry.clone()) else {
            debug!(target: "cdp-adapter", %tab, ?feature, "release on unattached tab");
            return false;
        };
        if !current.features.contains(&feature) {
            debug!(target: "cdp-adapter", %tab, ?feature, "feature holds no reference");
            return false;
        }

        let mut remaining = current.clone();
        remaining.features.remove(&feature);

        if remaining.features.is_empty() {
            self.attachments.remove(tab);
            self.router.unbind(&current.cdp_session);
            self.router.close_tab(tab);
            self.detach(tab, &current.cdp_session).await;
            info!(target: "cdp-adapter", %tab, ?feature, "last reference released; detached");
            return true;
        }

        let still_needed = remaining.domains();
        self.attachments.insert(tab.clone(), remaining);
        for domain in feature.domains() {
            if still_needed.contains(domain) {
                continue;
            }
            if let Err(err) = self
                .command(&current.cdp_session, domain.disable_method(), json!({}))
                .await
            {
                warn!(
                    target: "cdp-adapter",
                    %tab,
                    method = domain.disable_method(),
                    %err,
                    "disable failed"
                );
            }
        }
        info!(target: "cdp-adapter", %tab, ?feature, refs = self.ref_count(tab), "feature released");
        false
    }

    pub fn ref_count(&self, tab: &TabId) -> usize {
        self.attachments
            .get(tab)
            .map(|entry| entry.features.len())
            .unwrap_or(0)
    }

    pub fn is_attached(&self, tab: &TabId) -> bool {
        self.attachments.contains_key(tab)
    }

    pub fn holds(&self, tab: &TabId, feature: Feature) -> bool {
        self.attachments
            .get(tab)
            .map(|entry| entry.features.contains(&feature))
            .unwrap_or(false)
    }

    pub fn attached_tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .attachments
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tabs.sort();
        tabs
    }

    /// Registers a subscriber for events of `tab`. Subscribing before the first acquire
    /// guarantees no event of the new attachment is missed.
    pub fn subscribe(&self, tab: &TabId) -> TabSubscription {
        self.router.subscribe(tab, self.cfg.subscriber_buffer)
    }

    /// Sends a command on the tab's attached session.
    pub async fn send(
        &self,
        tab: &TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let cdp_session = self
            .attachments
            .get(tab)
            .map(|entry| entry.cdp_session.clone())
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::NotAttached)
                    .with_hint(format!("{method} on tab {tab}"))
            })?;
        self.command(&cdp_session, method, params).await
    }

    /// Forgets the tab's attachment without issuing a detach. Used when the target itself is
    /// gone; later releases for the tab are no-ops. Returns whether the tab was attached.
    pub fn handle_target_gone(&self, tab: &TabId) -> bool {
        self.target_gone(tab, None)
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabInfo>, AdapterError> {
        let result = self
            .browser_command("Target.getTargets", json!({}))
            .await?;
        let infos = result
            .get("targetInfos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(infos
            .iter()
            .filter(|info| info.get("type").and_then(Value::as_str) == Some("page"))
            .filter_map(|info| {
                let id = info.get("targetId").and_then(Value::as_str)?;
                Some(TabInfo {
                    tab: TabId::from(id),
                    url: string_field(info, "url"),
                    title: string_field(info, "title"),
                })
            })
            .collect())
    }

    pub async fn open_tab(&self, url: &str) -> Result<TabId, AdapterError> {
        let result = self
            .browser_command("Target.createTarget", json!({ "url": url }))
            .await?;
        result
            .get("targetId")
            .and_then(Value::as_str)
            .map(TabId::from)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint("Target.createTarget returned no targetId")
            })
    }

    fn tab_lock(&self, tab: &TabId) -> Arc<Mutex<()>> {
        self.locks
            .entry(tab.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn attach(&self, tab: &TabId) -> Result<String, AdapterError> {
        let result = self
            .browser_command(
                "Target.attachToTarget",
                json!({ "targetId": tab.as_str(), "flatten": true }),
            )
            .await
            .map_err(|err| {
                AdapterError::new(AdapterErrorKind::AttachFailed)
                    .with_hint(format!("tab {tab}: {err}"))
                    .retriable(err.retriable)
            })?;
        let session = result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::AttachFailed)
                    .with_hint(format!("tab {tab}: no sessionId in attach reply"))
            })?;
        metrics::record_attach();
        info!(target: "cdp-adapter", %tab, cdp_session = %session, "attached");
        Ok(session)
    }

    async fn detach(&self, tab: &TabId, cdp_session: &str) {
        let outcome = self
            .browser_command(
                "Target.detachFromTarget",
                json!({ "sessionId": cdp_session }),
            )
            .await;
        metrics::record_detach(outcome.is_ok());
        if let Err(err) = outcome {
            warn!(target: "cdp-adapter", %tab, %err, "detach failed; treating tab as detached");
        }
    }

    async fn rollback(&self, tab: &TabId, cdp_session: &str, enabled: &[Domain], fresh: bool) {
        if fresh {
            self.router.unbind(cdp_session);
            self.detach(tab, cdp_session).await;
            return;
        }
        for domain in enabled.iter().rev() {
            if let Err(err) = self
                .command(cdp_session, domain.disable_method(), json!({}))
                .await
            {
                debug!(target: "cdp-adapter", %tab, %err, "rollback disable failed");
            }
        }
    }

    async fn command(
        &self,
        cdp_session: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let started = Instant::now();
        let result = self
            .transport
            .send_command(CommandTarget::Session(cdp_session.to_string()), method, params)
            .await;
        metrics::record_command(method, started.elapsed(), result.is_ok());
        result
    }

    async fn browser_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let started = Instant::now();
        let result = self
            .transport
            .send_command(CommandTarget::Browser, method, params)
            .await;
        metrics::record_command(method, started.elapsed(), result.is_ok());
        result
    }

    fn target_gone(&self, tab: &TabId, cause: Option<&TransportEvent>) -> bool {
        let removed = self.attachments.remove(tab);
        if let Some((_, attachment)) = &removed {
            self.router.unbind(&attachment.cdp_session);
        }
        if let Some(event) = cause {
            self.router.deliver(tab, event);
        }
        self.router.close_tab(tab);
        if removed.is_some() {
            info!(target: "cdp-adapter", %tab, "target gone; attachment dropped");
        }
        removed.is_some()
    }

    async fn event_loop(self: Arc<Self>) {
        let mut backoff = MIN_RESTART_BACKOFF;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.transport.next_event() => match next {
                    Some(event) => {
                        backoff = MIN_RESTART_BACKOFF;
                        self.dispatch(event);
                    }
                    None => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        self.drop_all_attachments();
                        warn!(
                            target: "cdp-adapter",
                            backoff_ms = backoff.as_millis() as u64,
                            "event stream ended; restarting transport"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = sleep(backoff) => {}
                        }
                        if let Err(err) = self.transport.start().await {
                            warn!(target: "cdp-adapter", %err, "transport restart failed");
                        }
                        backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                    }
                }
            }
        }
        debug!(target: "cdp-adapter", "event loop stopped");
    }

    fn dispatch(&self, event: TransportEvent) {
        match event.method.as_str() {
            "Target.detachedFromTarget" => {
                let tab = event
                    .params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .and_then(|session| self.router.tab_for(session));
                if let Some(tab) = tab {
                    self.target_gone(&tab, Some(&event));
                }
            }
            "Target.targetDestroyed" | "Target.targetCrashed" => {
                if let Some(id) = event.params.get("targetId").and_then(Value::as_str) {
                    let tab = TabId::from(id);
                    if self.is_attached(&tab) {
                        self.target_gone(&tab, Some(&event));
                    }
                }
            }
            "Inspector.detached" => {
                let tab = event
                    .session_id
                    .as_deref()
                    .and_then(|session| self.router.tab_for(session));
                if let Some(tab) = tab {
                    self.target_gone(&tab, Some(&event));
                }
            }
            _ => {
                self.router.route(&event);
            }
        }
    }

    /// The browser connection was lost; every attachment died with it.
    fn drop_all_attachments(&self) {
        let tabs: Vec<TabId> = self
            .attachments
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for tab in tabs {
            self.target_gone(&tab, None);
        }
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
