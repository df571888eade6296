use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use super::context::CliContext;
use super::dispatch::dispatch;
use super::env::CliArgs;
use super::runtime::init_logging;
use crate::config::BugtrailConfig;

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();

    let (config, path) = BugtrailConfig::discover(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, cli.debug, cli.log_format.unwrap_or(config.logging.format))?;

    info!("Starting Bugtrail v{}", env!("CARGO_PKG_VERSION"));
    match &path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => debug!("no configuration file; using defaults and environment"),
    }

    let ctx = CliContext::new(config, path, cli.output);
    match dispatch(&cli, &ctx).await {
        Ok(()) => {
            debug!("Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}
