//! # Service Runtime Library
//!
//! The composition root of the GPII service, exposed as a library for
//! tests. The entry point is the `gpii-service` binary.
//!
//! ## Layout
//!
//! - `container/` - configuration and tracing setup
//! - `features/` - the companion client channel and the requests it can
//!   make (execute, credentials, signing), plus the metrics switch
//! - `runtime` - wiring, service control and shutdown
//! - `adapters/` - Win32 platform and named pipes (Windows only)

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod container;
pub mod features;
pub mod runtime;

pub use container::{load_config, ConfigError, ServiceConfig};
pub use features::CompanionClient;
pub use runtime::{RuntimeError, ServiceRuntime};
