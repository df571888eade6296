use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use timeline::{Correlator, RawBuffers, RecordingWindow};
use tracing::info;

use super::context::CliContext;
use super::runtime::emit;
use crate::output::{render, timeline_human};

#[derive(Args, Clone, Debug)]
pub struct CorrelateArgs {
    /// JSON file holding raw session buffers, or a flat array of events
    pub input: PathBuf,

    /// Collapse window for identical adjacent events; overrides correlator.dedup_window_ms
    #[arg(long)]
    pub dedup_window_ms: Option<u64>,

    /// Frame the timeline with recording markers, as START_MS,STOP_MS epoch milliseconds
    #[arg(long, value_name = "START_MS,STOP_MS", value_parser = parse_window)]
    pub window: Option<RecordingWindow>,

    /// Write the timeline to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub save: Option<PathBuf>,
}

pub async fn cmd_correlate(args: CorrelateArgs, ctx: &CliContext) -> Result<()> {
    let mut raw = RawBuffers::load(&args.input)
        .with_context(|| format!("Failed to read raw events from {}", args.input.display()))?;
    if args.window.is_some() {
        raw.window = args.window;
    }

    let mut policy = ctx.config().correlator.clone();
    if let Some(window) = args.dedup_window_ms {
        policy.dedup_window_ms = window;
    }
    let timeline = Correlator::with_policy(policy).correlate(&raw);
    info!(
        input = %args.input.display(),
        raw = raw.len(),
        events = timeline.events.len(),
        key_issues = timeline.key_issues.len(),
        "timeline correlated"
    );

    let text = render(&timeline, ctx.output(), timeline_human)?;
    emit(&text, args.save.as_deref()).await
}

fn parse_window(raw: &str) -> Result<RecordingWindow, String> {
    let (start, stop) = raw
        .split_once(',')
        .ok_or_else(|| "expected START_MS,STOP_MS".to_string())?;
    let started_at_ms: u64 = start.trim().parse().map_err(|_| format!("bad start: {start}"))?;
    let stopped_at_ms: u64 = stop.trim().parse().map_err(|_| format!("bad stop: {stop}"))?;
    if stopped_at_ms < started_at_ms {
        return Err("stop must not precede start".into());
    }
    Ok(RecordingWindow {
        started_at_ms,
        stopped_at_ms,
    })
}
