use clap::Subcommand;

use super::config::ConfigArgs;
use super::correlate::CorrelateArgs;
use super::hub::HubArgs;
use super::record::RecordArgs;

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Record a tab until the duration elapses, the tab closes or Ctrl-C
    Record(RecordArgs),

    /// Correlate a file of raw session events into a timeline
    Correlate(CorrelateArgs),

    /// Run only the backend log hub and print forwarded logs
    Hub(HubArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
