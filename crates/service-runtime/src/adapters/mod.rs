//! # Platform Adapters
//!
//! The Win32 implementation of [`shared_types::Platform`] and a named-pipe
//! [`sv_02_secure_channel::PipeServerFactory`]. Other targets have no
//! system adapters; tests use the simulated platform and in-memory pipes.

#[cfg(windows)]
pub mod windows;

use shared_types::{PlatformError, SharedPlatform};
use std::sync::Arc;
use sv_02_secure_channel::PipeServerFactory;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("the service only runs on Windows")]
    Unsupported,

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// The platform and pipe factory of the running system.
#[cfg(windows)]
pub fn system() -> Result<(SharedPlatform, Arc<dyn PipeServerFactory>), AdapterError> {
    let platform: SharedPlatform = Arc::new(windows::Win32Platform::new());
    Ok((platform, Arc::new(windows::NamedPipes)))
}

/// The platform and pipe factory of the running system.
#[cfg(not(windows))]
pub fn system() -> Result<(SharedPlatform, Arc<dyn PipeServerFactory>), AdapterError> {
    Err(AdapterError::Unsupported)
}
