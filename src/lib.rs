//! Bugtrail command-line application.
//!
//! Wires the recording crates together: configuration layering, logging, the prometheus endpoint
//! and the `bugtrail` subcommands.

pub mod cli;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod output;

pub use config::{BugtrailConfig, LogFormat};
pub use errors::{BugtrailError, BugtrailResult};
