//! # Ports
//!
//! The pipe transport the establisher listens on. The Windows adapter wraps
//! `tokio::net::windows::named_pipe`; tests use [`crate::adapters::MemoryPipes`].

use crate::error::ChannelError;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected pipe end.
pub trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PipeStream for T {}

/// Type-erased connected pipe.
pub type BoxedStream = Box<dyn PipeStream>;

/// A listening pipe. Dropping it stops accepting connections.
#[async_trait]
pub trait PipeServer: Send {
    /// Wait for the next client.
    async fn accept(&mut self) -> std::io::Result<BoxedStream>;
}

/// Creates pipe servers.
pub trait PipeServerFactory: Send + Sync {
    /// Create the first instance of `pipe_name`, accepting one client at a
    /// time. Fails with [`ChannelError::PipeInUse`] if another server
    /// already owns the name.
    fn bind(&self, pipe_name: &str) -> Result<Box<dyn PipeServer>, ChannelError>;
}
