//! Bugtrail network tap.
//!
//! Correlates the start, response and failure notifications of each request on a tab into network
//! events. Terminal notifications omit the request method, so the tap remembers `{url, method}` for
//! every in-flight request until its outcome arrives. Requests that never finish simply stay
//! pending until the tab is disabled.
//!
//! Chromium may report `loadingFailed` for a request whose response already arrived (a body
//! aborted by navigation, media range requests). Those are not failures of the request, so the
//! tap remembers a bounded window of answered ids and drops such late failures.

pub mod config;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bugtrail_core_types::{Event, NetworkPayload, TabId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

pub use crate::config::TapConfig;

const UNKNOWN: &str = "unknown";

/// Errors emitted by the tap surface.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TapError {
    #[error("tab not enabled")]
    PageNotEnabled,
    #[error("malformed {method} event: {reason}")]
    Malformed { method: String, reason: String },
}

/// Network notifications understood by the tap.
#[derive(Clone, Debug, PartialEq)]
pub enum TapEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        method: String,
        /// Present when this notification reports a redirect of an earlier hop.
        redirect: Option<ResponseInfo>,
    },
    ResponseReceived {
        request_id: String,
        response: ResponseInfo,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
        canceled: bool,
        blocked_reason: Option<String>,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseInfo {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub mime_type: Option<String>,
}

impl TapEvent {
    /// Decodes a `Network.*` protocol event. Returns `Ok(None)` for methods the tap ignores.
    pub fn from_cdp(method: &str, params: &Value) -> Result<Option<Self>, TapError> {
        let malformed = |reason: &str| TapError::Malformed {
            method: method.to_string(),
            reason: reason.to_string(),
        };
        let request_id = || {
            params
                .get("requestId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| malformed("missing requestId"))
        };

        let event = match method {
            "Network.requestWillBeSent" => {
                let request = params
                    .get("request")
                    .ok_or_else(|| malformed("missing request"))?;
                TapEvent::RequestWillBeSent {
                    request_id: request_id()?,
                    url: str_field(request, "url").unwrap_or(UNKNOWN).to_string(),
                    method: str_field(request, "method").unwrap_or(UNKNOWN).to_string(),
                    redirect: params.get("redirectResponse").map(ResponseInfo::from_cdp),
                }
            }
            "Network.responseReceived" => {
                let response = params
                    .get("response")
                    .ok_or_else(|| malformed("missing response"))?;
                TapEvent::ResponseReceived {
                    request_id: request_id()?,
                    response: ResponseInfo::from_cdp(response),
                }
            }
            "Network.loadingFailed" => TapEvent::LoadingFailed {
                request_id: request_id()?,
                error_text: str_field(params, "errorText")
                    .unwrap_or("request failed")
                    .to_string(),
                canceled: params
                    .get("canceled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                blocked_reason: str_field(params, "blockedReason").map(str::to_string),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl ResponseInfo {
    fn from_cdp(response: &Value) -> Self {
        let status = response
            .get("status")
            .and_then(Value::as_f64)
            .map(|status| status.clamp(0.0, u16::MAX as f64) as u16)
            .unwrap_or(0);
        Self {
            url: str_field(response, "url").unwrap_or_default().to_string(),
            status,
            status_text: str_field(response, "statusText")
                .unwrap_or_default()
                .to_string(),
            mime_type: str_field(response, "mimeType").map(str::to_string),
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// 2xx and 3xx count as success; everything else, including status 0, is a failure.
pub fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Cumulative counters of one tab.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub evicted: u64,
}

#[derive(Clone, Debug)]
struct PendingRequest {
    url: String,
    method: String,
    seq: u64,
}

#[derive(Default)]
struct TabState {
    pending: HashMap<String, PendingRequest>,
    next_seq: u64,
    /// Ids that already received a response, oldest first.
    answered: HashSet<String>,
    answered_order: VecDeque<String>,
    snapshot: NetworkSnapshot,
}

impl TabState {
    fn mark_answered(&mut self, request_id: &str, cap: usize) {
        if !self.answered.insert(request_id.to_string()) {
            return;
        }
        self.answered_order.push_back(request_id.to_string());
        while self.answered_order.len() > cap.max(1) {
            if let Some(oldest) = self.answered_order.pop_front() {
                self.answered.remove(&oldest);
            }
        }
    }

    fn forget_answered(&mut self, request_id: &str) -> bool {
        if !self.answered.remove(request_id) {
            return false;
        }
        self.answered_order.retain(|id| id != request_id);
        true
    }

    fn remember(&mut self, request_id: String, url: String, method: String, cap: usize) {
        if !self.pending.contains_key(&request_id) && self.pending.len() >= cap.max(1) {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                self.pending.remove(&id);
                self.snapshot.evicted += 1;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .insert(request_id, PendingRequest { url, method, seq });
        self.snapshot.pending = self.pending.len() as u64;
    }

    fn take(&mut self, request_id: &str) -> Option<PendingRequest> {
        let entry = self.pending.remove(request_id);
        self.snapshot.pending = self.pending.len() as u64;
        entry
    }

    fn count_outcome(&mut self, ok: bool) {
        if ok {
            self.snapshot.succeeded += 1;
        } else {
            self.snapshot.failed += 1;
        }
    }
}

/// Per-tab request correlation.
pub struct NetworkTap {
    states: DashMap<TabId, Arc<Mutex<TabState>>>,
    config: TapConfig,
}

impl Default for NetworkTap {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTap {
    pub fn new() -> Self {
        Self::with_config(TapConfig::default())
    }

    pub fn with_config(config: TapConfig) -> Self {
        Self {
            states: DashMap::new(),
            config,
        }
    }

    /// Starts tracking `tab`. Enabling an enabled tab keeps its state.
    pub fn enable(&self, tab: &TabId) {
        self.states.entry(tab.clone()).or_default();
    }

    /// Stops tracking `tab`, discarding any pending requests.
    pub fn disable(&self, tab: &TabId) -> Result<NetworkSnapshot, TapError> {
        let (_, state) = self.states.remove(tab).ok_or(TapError::PageNotEnabled)?;
        let snapshot = state.lock().snapshot.clone();
        Ok(snapshot)
    }

    pub fn is_enabled(&self, tab: &TabId) -> bool {
        self.states.contains_key(tab)
    }

    pub fn current_snapshot(&self, tab: &TabId) -> Option<NetworkSnapshot> {
        let state = self.states.get(tab)?.clone();
        let snapshot = state.lock().snapshot.clone();
        Some(snapshot)
    }

    pub fn pending_count(&self, tab: &TabId) -> usize {
        self.states
            .get(tab)
            .map(|state| state.lock().pending.len())
            .unwrap_or(0)
    }

    /// Feeds one notification for `tab`; returns the network event it completes, if any.
    pub fn ingest(
        &self,
        tab: &TabId,
        event: TapEvent,
        timestamp_ms: u64,
        relative_ms: u64,
    ) -> Result<Option<Event>, TapError> {
        let state = self
            .states
            .get(tab)
            .ok_or(TapError::PageNotEnabled)?
            .clone();
        let mut state = state.lock();

        match event {
            TapEvent::RequestWillBeSent {
                request_id,
                url,
                method,
                redirect,
            } => {
                // A redirect reuses the request id; the previous hop completes here.
                let finished_hop = redirect.and_then(|response| {
                    let previous = state.take(&request_id)?;
                    let ok = is_success(response.status);
                    state.count_outcome(ok);
                    Some(Event::network(
                        timestamp_ms,
                        relative_ms,
                        NetworkPayload {
                            request_id: request_id.clone(),
                            url: previous.url,
                            method: previous.method,
                            status: Some(response.status),
                            status_text: Some(response.status_text),
                            mime_type: response.mime_type,
                            ok,
                            ..NetworkPayload::default()
                        },
                    ))
                });

                if self.ignored(&url) {
                    trace!(target: "network-tap", %tab, %url, "ignored scheme");
                    return Ok(finished_hop);
                }
                state.forget_answered(&request_id);
                state.snapshot.requests += 1;
                state.remember(request_id, url, method, self.config.max_pending);
                Ok(finished_hop)
            }
            TapEvent::ResponseReceived {
                request_id,
                response,
            } => {
                state.mark_answered(&request_id, self.config.max_pending);
                let Some(pending) = state.take(&request_id) else {
                    // Ignored schemes and requests started before recording land here.
                    if self.ignored(&response.url) || response.url.is_empty() {
                        return Ok(None);
                    }
                    debug!(target: "network-tap", %tab, %request_id, "response without start");
                    let ok = is_success(response.status);
                    state.count_outcome(ok);
                    return Ok(Some(Event::network(
                        timestamp_ms,
                        relative_ms,
                        NetworkPayload {
                            request_id,
                            url: response.url,
                            method: UNKNOWN.to_string(),
                            status: Some(response.status),
                            status_text: Some(response.status_text),
                            mime_type: response.mime_type,
                            ok,
                            ..NetworkPayload::default()
                        },
                    )));
                };
                let ok = is_success(response.status);
                state.count_outcome(ok);
                Ok(Some(Event::network(
                    timestamp_ms,
                    relative_ms,
                    NetworkPayload {
                        request_id,
                        url: pending.url,
                        method: pending.method,
                        status: Some(response.status),
                        status_text: Some(response.status_text),
                        mime_type: response.mime_type,
                        ok,
                        ..NetworkPayload::default()
                    },
                )))
            }
            TapEvent::LoadingFailed {
                request_id,
                error_text,
                canceled,
                blocked_reason,
            } => {
                let (url, method) = match state.take(&request_id) {
                    Some(pending) => (pending.url, pending.method),
                    None if state.forget_answered(&request_id) => {
                        debug!(
                            target: "network-tap",
                            %tab,
                            %request_id,
                            %error_text,
                            "failure after response; request already completed"
                        );
                        return Ok(None);
                    }
                    None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
                };
                if self.ignored(&url) {
                    return Ok(None);
                }
                state.count_outcome(false);
                Ok(Some(Event::network(
                    timestamp_ms,
                    relative_ms,
                    NetworkPayload {
                        request_id,
                        url,
                        method,
                        status: None,
                        status_text: None,
                        mime_type: None,
                        ok: false,
                        error_text: Some(error_text),
                        canceled,
                        blocked_reason,
                    },
                )))
            }
        }
    }

    fn ignored(&self, url: &str) -> bool {
        self.config
            .ignored_url_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }
}
