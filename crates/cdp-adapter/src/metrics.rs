use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{core::Collector, histogram_opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tracing::error;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub attaches: u64,
    pub detaches: u64,
    pub detach_failures: u64,
    pub commands: u64,
    pub command_failures: u64,
    pub events_routed: u64,
    pub events_dropped: u64,
}

static ATTACHES: AtomicU64 = AtomicU64::new(0);
static DETACHES: AtomicU64 = AtomicU64::new(0);
static DETACH_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMMANDS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static EVENTS_ROUTED: AtomicU64 = AtomicU64::new(0);
static EVENTS_DROPPED: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref ATTACH_TOTAL: IntCounter = IntCounter::new(
        "bugtrail_cdp_attach_total",
        "Physical attachments to tab targets"
    )
    .unwrap();
    static ref DETACH_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("bugtrail_cdp_detach_total", "Physical detaches from tab targets"),
        &["outcome"]
    )
    .unwrap();
    static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("bugtrail_cdp_commands_total", "CDP commands sent"),
        &["method"]
    )
    .unwrap();
    static ref COMMAND_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("bugtrail_cdp_command_failures_total", "CDP commands that failed"),
        &["method"]
    )
    .unwrap();
    static ref COMMAND_DURATION: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "bugtrail_cdp_command_duration_seconds",
            "CDP command latency",
            vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("bugtrail_cdp_events_total", "Tab events by routing outcome"),
        &["outcome"]
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register cdp metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, ATTACH_TOTAL.clone());
    register(registry, DETACH_TOTAL.clone());
    register(registry, COMMANDS_TOTAL.clone());
    register(registry, COMMAND_FAILURES_TOTAL.clone());
    register(registry, COMMAND_DURATION.clone());
    register(registry, EVENTS_TOTAL.clone());
}

pub fn record_attach() {
    ATTACHES.fetch_add(1, Ordering::Relaxed);
    ATTACH_TOTAL.inc();
}

pub fn record_detach(ok: bool) {
    if ok {
        DETACHES.fetch_add(1, Ordering::Relaxed);
        DETACH_TOTAL.with_label_values(&["ok"]).inc();
    } else {
        DETACH_FAILURES.fetch_add(1, Ordering::Relaxed);
        DETACH_TOTAL.with_label_values(&["failed"]).inc();
    }
}

pub fn record_command(method: &str, elapsed: Duration, ok: bool) {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
    COMMANDS_TOTAL.with_label_values(&[method]).inc();
    COMMAND_DURATION
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
    if !ok {
        COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
        COMMAND_FAILURES_TOTAL.with_label_values(&[method]).inc();
    }
}

pub fn record_event_routed() {
    EVENTS_ROUTED.fetch_add(1, Ordering::Relaxed);
    EVENTS_TOTAL.with_label_values(&["routed"]).inc();
}

pub fn record_event_dropped() {
    EVENTS_DROPPED.fetch_add(1, Ordering::Relaxed);
    EVENTS_TOTAL.with_label_values(&["dropped"]).inc();
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        attaches: ATTACHES.load(Ordering::Relaxed),
        detaches: DETACHES.load(Ordering::Relaxed),
        detach_failures: DETACH_FAILURES.load(Ordering::Relaxed),
        commands: COMMANDS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        events_routed: EVENTS_ROUTED.load(Ordering::Relaxed),
        events_dropped: EVENTS_DROPPED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-global and other tests bump them concurrently.
    #[test]
    fn counters_move_forward() {
        let before = snapshot();
        record_command("Network.enable", Duration::from_micros(150), false);
        record_detach(false);
        let after = snapshot();
        assert!(after.commands > before.commands);
        assert!(after.command_failures > before.command_failures);
        assert!(after.detach_failures > before.detach_failures);
    }

    #[test]
    fn registers_into_custom_registry() {
        let registry = Registry::new();
        register_metrics(&registry);
        record_attach();
        let names: Vec<String> = registry
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|name| name == "bugtrail_cdp_attach_total"));
    }
}
