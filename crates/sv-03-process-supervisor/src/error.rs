//! Error types for the process supervisor

use shared_types::PlatformError;
use sv_02_secure_channel::ChannelError;
use thiserror::Error;

/// Death-watch failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// Opening the process or waiting on it failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The wait thread could not be started.
    #[error("Unable to start the wait thread: {0}")]
    Thread(String),

    /// The monitor went away before the process ended.
    #[error("Process monitor dropped")]
    Dropped,
}

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SupervisorError {
    #[error("Process {key} is not configured")]
    UnknownProcess { key: String },

    #[error("Process {key} is already starting")]
    AlreadyStarting { key: String },

    #[error("Process {key} is already running")]
    AlreadyRunning { key: String },

    #[error("Process {key} is disabled")]
    Disabled { key: String },

    /// Neither a command nor an ipc channel.
    #[error("Process {key} has nothing to start")]
    NothingToStart { key: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}
