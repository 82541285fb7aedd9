//! Domain layer: configuration, records and the restart throttle.

pub mod config;
pub mod record;
pub mod restart;

pub use config::ProcessConfig;
pub use record::{ChildProcessRecord, ProcessState};
pub use restart::{RestartDecision, RestartPolicy};
