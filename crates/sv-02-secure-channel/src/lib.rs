//! # sv-02-secure-channel
//!
//! Authenticated named-pipe channels between the service and the processes
//! it launches in the user's desktop session.
//!
//! ## Security
//!
//! - The pipe name is random per launch and reaches the child only through
//!   its environment (`GPII_SERVICE_PIPE`)
//! - The pipe accepts a single client, which must signal an event that was
//!   duplicated into the launched process alone
//! - The desktop user is granted access to the pipe; nothing else is
//!
//! ## Example
//!
//! ```rust,ignore
//! let establisher = ChannelEstablisher::new(platform, pipes, bus);
//! let started = establisher
//!     .start_process(Some("gpii.exe"), Some("gpii"), StartOptions::default())
//!     .await?;
//! let connection = started.connection.await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod auth;
pub mod client;
pub mod domain;
pub mod error;
pub mod establisher;
pub mod execute;
pub mod ports;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{validate_client, DEFAULT_AUTH_TIMEOUT};
pub use client::{answer_challenge, pipe_name_from_env};
pub use domain::{
    channel_pipe_name, generate_pipe_name, merge_environment, pipe_env_value,
    pipe_name_from_env_value, ChannelInfo, ExecuteOptions, IpcConnection, StartOptions,
    NO_CHALLENGE, OK_LINE, PIPE_ENV_VAR, PIPE_PREFIX,
};
pub use error::{AuthError, ChannelError, LaunchError};
pub use establisher::{ChannelEstablisher, Established, Establishing, StartedProcess};
pub use execute::Launcher;
pub use ports::{BoxedStream, PipeServer, PipeServerFactory, PipeStream};
