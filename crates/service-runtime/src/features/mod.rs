//! Features built on top of the channels and the supervisor. The companion
//! client follows the bus instead of being called by the runtime.

pub mod client;
pub mod execute;
pub mod metrics;
pub mod secrets;

pub use client::CompanionClient;
pub use execute::{execute, ExecuteError, ExecuteRequest, ExecuteResult};
pub use metrics::MetricsSwitch;
pub use secrets::{SecretsFile, SignRequest};
