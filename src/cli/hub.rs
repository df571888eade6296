use std::fmt::Write as _;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use bugtrail_core_types::BackendLevel;
use clap::Args;
use session_recorder::{BackendHub, BackendLogEntry};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::CliContext;
use super::runtime::interrupted;
use crate::metrics::spawn_metrics_server;
use crate::output::{wall_clock, OutputFormat};

#[derive(Args, Clone, Debug)]
pub struct HubArgs {
    /// Address to listen on; overrides hub.bind
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Ask clients to forward debug and trace output too
    #[arg(long)]
    pub capture_stdout: bool,

    /// Serve prometheus metrics on this port
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

/// Runs the hub in recording mode until Ctrl-C and prints every forwarded record.
pub async fn cmd_hub(args: HubArgs, ctx: &CliContext) -> Result<()> {
    let cfg = ctx.config();
    let mut hub_cfg = cfg.hub.clone();
    if let Some(bind) = args.bind {
        hub_cfg.bind = bind;
    }
    let capture = args.capture_stdout || cfg.record.capture_stdout;
    let metrics = spawn_metrics_server(args.metrics_port.unwrap_or(cfg.record.metrics_port));

    let listener = TcpListener::bind(hub_cfg.bind)
        .await
        .with_context(|| format!("Failed to bind the log hub on {}", hub_cfg.bind))?;
    let addr = listener.local_addr()?;
    let hub = BackendHub::with_capture(hub_cfg, capture);
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(hub.clone().serve(listener, shutdown.clone()));

    let mut logs = hub.subscribe_logs();
    hub.begin_recording();
    info!(%addr, capture_stdout = capture, "hub is recording; press Ctrl-C to stop");

    let json = ctx.output() == OutputFormat::Json;
    let stop = interrupted();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            received = logs.recv() => match received {
                Ok(entry) => {
                    if json {
                        println!("{}", serde_json::to_string(&entry)?);
                    } else {
                        print!("{}", entry_line(&entry));
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "log printer fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    hub.end_recording();
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?err, "log hub stopped with an error"),
        Err(err) => warn!(?err, "log hub task failed"),
    }
    if let Some(metrics) = metrics {
        metrics.abort();
    }
    info!(clients = hub.client_count(), "hub stopped");
    Ok(())
}

fn entry_line(entry: &BackendLogEntry) -> String {
    let level = match entry.record.level {
        BackendLevel::Log => "LOG",
        BackendLevel::Warn => "WARN",
        BackendLevel::Error => "ERROR",
    };
    let port = entry
        .server_port
        .map(|port| format!(":{port}"))
        .unwrap_or_else(|| "-".into());
    let mut line = format!(
        "[{}] {} {:<5} {}\n",
        wall_clock(entry.record.timestamp),
        port,
        level,
        entry.record.message
    );
    if let Some(stack) = &entry.record.stack {
        for frame in stack.lines() {
            let _ = writeln!(line, "    {}", frame.trim());
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugtrail_core_types::LogRecord;

    #[test]
    fn entries_print_port_level_and_stack() {
        let entry = BackendLogEntry {
            server_port: Some(8080),
            record: LogRecord {
                level: BackendLevel::Error,
                message: "db down".into(),
                timestamp: 0,
                stack: Some("Error: db down\n  at query (db.js:4)".into()),
            },
        };
        assert_eq!(
            entry_line(&entry),
            "[1970-01-01T00:00:00.000Z] :8080 ERROR db down\n    Error: db down\n    at query (db.js:4)\n"
        );
    }

    #[test]
    fn unregistered_clients_print_a_dash() {
        let entry = BackendLogEntry {
            server_port: None,
            record: LogRecord {
                level: BackendLevel::Log,
                message: "ready".into(),
                timestamp: 0,
                stack: None,
            },
        };
        assert!(entry_line(&entry).contains(" - LOG   ready"));
    }
}
