use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bugtrail_core_types::TabId;
use bugtrail_event_bus::{EventBus, InMemoryBus};
use cdp_adapter::attachment::TabInfo;
use cdp_adapter::{ChromiumTransport, InspectionManager};
use clap::Args;
use session_recorder::{BackendHub, SessionEvent, SessionManager, Viewport, ViewportEmulation};
use timeline::Correlator;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::CliContext;
use super::runtime::{emit, interrupted};
use crate::errors::BugtrailError;
use crate::metrics::spawn_metrics_server;
use crate::output::{render, report_human};

#[derive(Args, Clone, Debug)]
pub struct RecordArgs {
    /// Target id of the tab to record
    #[arg(long)]
    pub tab: Option<String>,

    /// Open this URL in a new tab and record it
    #[arg(long, conflicts_with = "tab")]
    pub url: Option<String>,

    /// Stop after this long (e.g. 30s, 2m); otherwise wait for Ctrl-C or the tab closing
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// DevTools websocket of a running browser; overrides cdp.websocket_url
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Launch the browser headless
    #[arg(long)]
    pub headless: bool,

    /// Emulate a viewport while recording, as WIDTHxHEIGHT[@SCALE]
    #[arg(long, value_parser = parse_viewport)]
    pub viewport: Option<Viewport>,

    /// Emulate a mobile device with the given viewport
    #[arg(long, requires = "viewport")]
    pub mobile: bool,

    /// Do not serve the backend log hub
    #[arg(long)]
    pub no_hub: bool,

    /// Ask backend clients for debug and trace output too
    #[arg(long)]
    pub capture_stdout: bool,

    /// Serve prometheus metrics on this port while recording
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Write the report to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub save: Option<PathBuf>,
}

pub async fn cmd_record(args: RecordArgs, ctx: &CliContext) -> Result<()> {
    let cfg = ctx.config();
    let mut cdp = cfg.cdp.clone();
    if let Some(url) = &args.ws_url {
        cdp.websocket_url = Some(url.clone());
    }
    if args.headless {
        cdp.headless = true;
    }

    let metrics = spawn_metrics_server(args.metrics_port.unwrap_or(cfg.record.metrics_port));

    let transport = Arc::new(ChromiumTransport::new(cdp.clone()));
    let inspection = InspectionManager::new(cdp, transport);
    inspection
        .start()
        .await
        .context("Failed to reach the browser")?;

    let tab = resolve_tab(&inspection, &args).await?;
    info!(tab = %tab, "recording target selected");

    let hub = if args.no_hub || !cfg.record.serve_hub {
        None
    } else {
        let listener = TcpListener::bind(cfg.hub.bind)
            .await
            .with_context(|| format!("Failed to bind the log hub on {}", cfg.hub.bind))?;
        let hub = BackendHub::with_capture(
            cfg.hub.clone(),
            args.capture_stdout || cfg.record.capture_stdout,
        );
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(hub.clone().serve(listener, shutdown.clone()));
        Some((hub, shutdown, server))
    };

    let bus = InMemoryBus::<SessionEvent>::new(16);
    let mut events = bus.subscribe();

    let mut builder = SessionManager::builder(inspection.clone())
        .config(cfg.recorder())
        .correlator(Correlator::with_policy(cfg.correlator.clone()))
        .bus(bus);
    if let Some((hub, _, _)) = &hub {
        builder = builder.hub(hub.clone());
    }
    let sessions = builder.build();

    let viewport = ViewportEmulation::new(inspection.clone());
    let outcome = async {
        if let Some(mut vp) = args.viewport {
            vp.mobile = args.mobile;
            viewport.apply(&tab, vp).await?;
        }
        let handle = sessions.start_session(&tab).await?;
        info!(session = %handle.session, "recording; press Ctrl-C to stop");
        wait_for_stop(&tab, args.duration, &mut events).await;
        Ok::<_, BugtrailError>(sessions.stop_session(&tab).await?)
    }
    .await;

    viewport.clear(&tab).await;
    if let Some((_hub, shutdown, server)) = hub {
        shutdown.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(?err, "log hub stopped with an error"),
            Err(err) => warn!(?err, "log hub task failed"),
        }
    }
    inspection.shutdown().await;
    if let Some(metrics) = metrics {
        metrics.abort();
    }

    let report = outcome?;
    let text = render(&report, ctx.output(), report_human)?;
    emit(&text, args.save.as_deref()).await
}

async fn resolve_tab(inspection: &InspectionManager, args: &RecordArgs) -> Result<TabId> {
    if let Some(url) = &args.url {
        return Ok(inspection.open_tab(url).await?);
    }
    if let Some(raw) = &args.tab {
        return TabId::parse(raw).context("Invalid --tab");
    }
    let tabs = inspection.list_tabs().await?;
    Ok(pick_tab(&tabs).ok_or(BugtrailError::NoTab)?)
}

/// Prefers the first page showing real content, then any page.
fn pick_tab(tabs: &[TabInfo]) -> Option<TabId> {
    tabs.iter()
        .find(|info| !is_blank(&info.url))
        .or_else(|| tabs.first())
        .map(|info| info.tab.clone())
}

fn is_blank(url: &str) -> bool {
    url.is_empty()
        || url.starts_with("about:")
        || url.starts_with("chrome://")
        || url.starts_with("chrome-extension://")
        || url.starts_with("devtools://")
}

async fn wait_for_stop(
    tab: &TabId,
    duration: Option<Duration>,
    events: &mut broadcast::Receiver<SessionEvent>,
) {
    let elapsed = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let aborted = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Aborted { tab: closed, .. }) if &closed == tab => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };
    tokio::select! {
        _ = interrupted() => info!("interrupted"),
        _ = elapsed => info!("duration elapsed"),
        _ = aborted => warn!(tab = %tab, "tab closed during recording"),
    }
}

fn parse_viewport(raw: &str) -> Result<Viewport, String> {
    let (size, scale) = match raw.split_once('@') {
        Some((size, scale)) => {
            let scale: f64 = scale
                .trim()
                .parse()
                .map_err(|_| format!("bad scale factor: {scale}"))?;
            if scale.is_nan() || scale <= 0.0 {
                return Err("scale factor must be positive".into());
            }
            (size, scale)
        }
        None => (raw, 1.0),
    };
    let (width, height) = size
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let width: u32 = width.trim().parse().map_err(|_| format!("bad width: {width}"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("bad height: {height}"))?;
    if width == 0 || height == 0 {
        return Err("width and height must be positive".into());
    }
    Ok(Viewport {
        width,
        height,
        device_scale_factor: scale,
        mobile: false,
    })
}
