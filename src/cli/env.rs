use clap::Parser;
use std::path::PathBuf;

use super::commands::Commands;
use crate::config::LogFormat;
use crate::output::OutputFormat;

/// Bugtrail - record a browser tab and its backend into one incident timeline
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset; overrides logging.level
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Log line format; overrides logging.format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}
