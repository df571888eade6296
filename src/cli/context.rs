use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::BugtrailConfig;
use crate::output::OutputFormat;

pub struct CliContext {
    config: Arc<BugtrailConfig>,
    config_path: Option<PathBuf>,
    output: OutputFormat,
}

impl CliContext {
    pub fn new(config: BugtrailConfig, config_path: Option<PathBuf>, output: OutputFormat) -> Self {
        Self {
            config: Arc::new(config),
            config_path,
            output,
        }
    }

    pub fn config(&self) -> &BugtrailConfig {
        self.config.as_ref()
    }

    /// The file the configuration was read from, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn output(&self) -> OutputFormat {
        self.output
    }
}
