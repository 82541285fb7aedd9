//! # sv-03-process-supervisor
//!
//! Lifecycle of the processes the service runs in the desktop user's
//! session.
//!
//! ## Overview
//!
//! - **Liveness**: [`is_process_running`] compares creation times so a
//!   recycled PID is never mistaken for the original process
//! - **Death-watch**: [`ProcessMonitor`] waits on every process with one
//!   blocking thread and a control event
//! - **Restart throttle**: [`RestartPolicy`] backs off `failures × 10 s` and
//!   gives up after more than five crashes within 20 s of starting
//!
//! ```rust,ignore
//! let supervisor = ProcessSupervisor::new(platform, channels, bus, SupervisorConfig::default());
//! supervisor.configure(config.processes);
//! supervisor.spawn_session_listener();
//! supervisor.start_child_processes().await;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod domain;
pub mod error;
pub mod liveness;
pub mod monitor;
pub mod supervisor;

pub use domain::{ChildProcessRecord, ProcessConfig, ProcessState, RestartDecision, RestartPolicy};
pub use error::{MonitorError, SupervisorError};
pub use liveness::{is_process_running, process_creation_time};
pub use monitor::{FailureAttribution, MonitorOutcome, Monitored, ProcessMonitor};
pub use supervisor::{ProcessSupervisor, StartHook, SupervisorConfig};
