//! Cross-crate flows, all on the simulated platform and in-memory pipes.

pub mod channel_flows;
pub mod service_flows;
pub mod supervisor_flows;
