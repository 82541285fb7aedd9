//! Named pipe servers on tokio's Windows pipe support.

use async_trait::async_trait;
use std::io;
use sv_02_secure_channel::{BoxedStream, ChannelError, PipeServer, PipeServerFactory};
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tracing::debug;

const ERROR_ACCESS_DENIED: i32 = 5;

/// Binds local named pipes.
pub struct NamedPipes;

impl PipeServerFactory for NamedPipes {
    fn bind(&self, name: &str) -> Result<Box<dyn PipeServer>, ChannelError> {
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(name)
            .map_err(|e| match e.raw_os_error() {
                // Another server already owns the name.
                Some(ERROR_ACCESS_DENIED) => ChannelError::PipeInUse {
                    name: name.to_string(),
                },
                _ => ChannelError::Bind {
                    name: name.to_string(),
                    reason: e.to_string(),
                },
            })?;
        Ok(Box::new(NamedPipeListener {
            name: name.to_string(),
            next: Some(first),
        }))
    }
}

/// Keeps one unconnected instance ready while it lives.
struct NamedPipeListener {
    name: String,
    next: Option<NamedPipeServer>,
}

impl NamedPipeListener {
    fn instance(&self) -> io::Result<NamedPipeServer> {
        ServerOptions::new()
            .reject_remote_clients(true)
            .create(&self.name)
    }
}

#[async_trait]
impl PipeServer for NamedPipeListener {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        let server = match self.next.take() {
            Some(server) => server,
            None => self.instance()?,
        };
        server.connect().await?;

        match self.instance() {
            Ok(next) => self.next = Some(next),
            Err(e) => debug!(pipe = %self.name, error = %e, "No spare pipe instance"),
        }
        Ok(Box::new(server))
    }
}
