//! Configuration of a supervised process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One entry of the `processes` table of the service configuration.
///
/// Field names follow the service's JSON configuration (`autoRestart`,
/// `noAuth`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfig {
    /// Identifier; filled in from the table key when loaded.
    pub key: String,
    /// Command line. `None` for a pipe-only entry.
    pub command: Option<String>,
    /// Restart the process when it terminates.
    pub auto_restart: bool,
    /// Channel name for a pipe to the process.
    pub ipc: Option<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    /// Skip client authentication on the channel.
    pub no_auth: bool,
    /// The client runs as administrator; leave the pipe ACL alone.
    pub admin: bool,
    /// Configured but not started by `start_child_processes`.
    pub disabled: bool,
}

impl ProcessConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_ipc(mut self, channel: impl Into<String>) -> Self {
        self.ipc = Some(channel.into());
        self
    }

    #[must_use]
    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    /// Whether there is anything to start.
    pub fn is_startable(&self) -> bool {
        self.command.is_some() || self.ipc.is_some()
    }
}
