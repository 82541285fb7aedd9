//! In-memory named pipes over [`tokio::io::duplex`].
//!
//! Mirrors the named-pipe rules the establisher relies on: a name has one
//! server, connecting to a name nobody serves fails, and dropping the
//! server stops new connections.

use crate::error::ChannelError;
use crate::ports::{BoxedStream, PipeServer, PipeServerFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;

/// Buffer size of each in-memory pipe direction.
const PIPE_BUFFER: usize = 64 * 1024;

type Listeners = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>;

/// A namespace of in-memory pipes.
#[derive(Clone, Default)]
pub struct MemoryPipes {
    listeners: Listeners,
}

impl MemoryPipes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to a served pipe. Callable outside a runtime.
    pub fn connect(&self, pipe_name: &str) -> io::Result<DuplexStream> {
        let listeners = self.listeners.lock();
        let sender = listeners
            .get(pipe_name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, pipe_name.to_string()))?;
        let (server_end, client_end) = duplex(PIPE_BUFFER);
        sender
            .send(server_end)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, pipe_name.to_string()))?;
        Ok(client_end)
    }

    /// Whether a server currently owns `pipe_name`.
    pub fn is_listening(&self, pipe_name: &str) -> bool {
        self.listeners.lock().contains_key(pipe_name)
    }
}

impl PipeServerFactory for MemoryPipes {
    fn bind(&self, pipe_name: &str) -> Result<Box<dyn PipeServer>, ChannelError> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(pipe_name) {
            return Err(ChannelError::PipeInUse {
                name: pipe_name.to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(pipe_name.to_string(), tx);
        Ok(Box::new(MemoryPipeServer {
            name: pipe_name.to_string(),
            incoming: rx,
            listeners: self.listeners.clone(),
        }))
    }
}

struct MemoryPipeServer {
    name: String,
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    listeners: Listeners,
}

#[async_trait]
impl PipeServer for MemoryPipeServer {
    async fn accept(&mut self) -> io::Result<BoxedStream> {
        match self.incoming.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, self.name.clone())),
        }
    }
}

impl Drop for MemoryPipeServer {
    fn drop(&mut self) {
        self.listeners.lock().remove(&self.name);
    }
}
