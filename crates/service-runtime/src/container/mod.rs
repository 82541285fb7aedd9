//! # Service Container
//!
//! Configuration and tracing setup for the composition root.

pub mod config;
pub mod logging;

pub use config::{
    expand_environment_strings, load_config, ClientConfig, ConfigError, IpcConfig, LoggingConfig,
    MetricsConfig, ServiceConfig, ShutdownConfig, SupervisorSection,
};
pub use logging::init_tracing;
