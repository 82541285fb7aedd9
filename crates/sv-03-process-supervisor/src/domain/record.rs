//! Runtime record of a supervised process.

use super::config::ProcessConfig;
use serde::{Deserialize, Serialize};
use shared_types::{CreationToken, Pid};
use std::time::Instant;

/// Lifecycle of a supervised process.
///
/// ```text
/// Stopped ─► Starting ─► Running ─┬─► Stopping ─► Stopped
///    ▲                            └─► Crashed ──┬─► Restarting ─► Starting
///    │                                           ├─► Stopped
///    └───────────────────────────────────────────┘   Abandoned (too many early crashes)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Restarting,
    /// Gave up restarting after repeated early crashes.
    Abandoned,
}

impl ProcessState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Restarting)
    }
}

/// A configured process and what is known about its current instance.
#[derive(Debug, Clone)]
pub struct ChildProcessRecord {
    pub config: ProcessConfig,
    pub pid: Option<Pid>,
    /// Creation time of `pid`, captured at start to detect PID reuse.
    pub creation: Option<CreationToken>,
    pub last_start: Option<Instant>,
    /// Consecutive early failures.
    pub failure_count: u32,
    /// Set when the next termination is intentional.
    pub shutdown: bool,
    pub state: ProcessState,
    /// A death-watch is registered for the current instance.
    pub watched: bool,
}

impl ChildProcessRecord {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            pid: None,
            creation: None,
            last_start: None,
            failure_count: 0,
            shutdown: false,
            state: ProcessState::Stopped,
            watched: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }
}
