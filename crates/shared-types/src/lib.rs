//! # Shared Types Crate
//!
//! Identifiers and capabilities shared by every crate of the service.
//!
//! ## Design Principles
//!
//! - **Opaque handles**: kernel objects are referenced by [`RawHandle`] values
//!   that only the [`Platform`] interprets.
//! - **One error shape**: every failing OS call becomes a [`PlatformError`].
//! - **Explicit ownership**: a handle that must be closed is held by an
//!   [`OwnedHandle`] and closed when it drops.

pub mod entities;
pub mod errors;
pub mod platform;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use entities::*;
pub use errors::*;
pub use platform::{OwnedHandle, Platform, SharedPlatform};
