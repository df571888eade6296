use anyhow::Result;

use super::commands::Commands;
use super::config::cmd_config;
use super::context::CliContext;
use super::correlate::cmd_correlate;
use super::env::CliArgs;
use super::hub::cmd_hub;
use super::record::cmd_record;

pub async fn dispatch(cli: &CliArgs, ctx: &CliContext) -> Result<()> {
    match cli.command.clone() {
        Commands::Record(args) => cmd_record(args, ctx).await,
        Commands::Correlate(args) => cmd_correlate(args, ctx).await,
        Commands::Hub(args) => cmd_hub(args, ctx).await,
        Commands::Config(args) => cmd_config(args, ctx).await,
    }
}
