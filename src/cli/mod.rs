//! The `bugtrail` subcommands.

pub mod app;
pub mod commands;
pub mod config;
pub mod context;
pub mod correlate;
pub mod dispatch;
pub mod env;
pub mod hub;
pub mod record;
pub mod runtime;

pub use app::run;
pub use env::CliArgs;
