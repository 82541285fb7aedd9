//! # Channel Establisher
//!
//! Starts a child in the user's session with a private pipe, proves the
//! connecting client is that child, and runs a messaging session over the
//! pipe.
//!
//! ## Flow
//!
//! ```text
//! start_process
//!   ├─ bind pipe (random name per launch, or the channel's well-known name)
//!   ├─ grant the desktop user access, swallow the granting connection
//!   ├─ launch child with GPII_SERVICE_PIPE=pipe:<suffix>
//!   └─ serve task
//!        ├─ authenticated: accept one client, stop listening, challenge it
//!        └─ open: accept any client, reply "challenge:none\nOK\n"
//!             └─ messaging session (session type = channel name)
//! ```
//!
//! Session lifecycle is published on the event bus as
//! `ChannelConnected` / `ChannelClosed` / `ChannelError`.

use crate::auth::{validate_client, DEFAULT_AUTH_TIMEOUT};
use crate::domain::challenge::NO_CHALLENGE;
use crate::domain::connection::{ChannelInfo, IpcConnection, StartOptions};
use crate::domain::launch::ExecuteOptions;
use crate::domain::pipe_name::{channel_pipe_name, generate_pipe_name, pipe_env_value, PIPE_ENV_VAR};
use crate::error::{AuthError, ChannelError};
use crate::execute::Launcher;
use crate::ports::{BoxedStream, PipeServer, PipeServerFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use shared_bus::{InMemoryEventBus, ServiceEvent};
use shared_types::{Pid, SharedPlatform};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use sv_01_pipe_messaging::{
    HandlerError, Payload, RequestHandler, Session, SessionEvent, SessionEvents, SessionHandle,
    SessionOptions, SharedHandler,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

// =============================================================================
// ESTABLISHED CONNECTIONS
// =============================================================================

/// A connected, and if requested authenticated, client.
pub enum Established {
    /// Messaging session over the pipe.
    Session(SessionHandle),
    /// The channel opted out of messaging. `early` holds bytes the client
    /// sent before authentication finished.
    Raw { stream: BoxedStream, early: Vec<u8> },
}

impl Established {
    pub fn session(&self) -> Option<&SessionHandle> {
        match self {
            Self::Session(session) => Some(session),
            Self::Raw { .. } => None,
        }
    }
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(session) => f.debug_tuple("Session").field(session).finish(),
            Self::Raw { early, .. } => f.debug_struct("Raw").field("early", &early.len()).finish(),
        }
    }
}

/// Resolves when the first client has connected (and authenticated).
#[derive(Debug)]
pub struct Establishing {
    rx: oneshot::Receiver<Result<Established, ChannelError>>,
}

impl Future for Establishing {
    type Output = Result<Established, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ChannelError::Aborted)))
    }
}

/// Result of [`ChannelEstablisher::start_process`].
#[derive(Debug)]
pub struct StartedProcess {
    /// PID of the launched child, `None` when only a pipe was opened.
    pub pid: Option<Pid>,
    pub pipe_name: String,
    pub connection: Establishing,
}

// =============================================================================
// ESTABLISHER
// =============================================================================

struct ChannelSlot {
    connection: IpcConnection,
    serve_task: Option<AbortHandle>,
}

type Channels = Arc<Mutex<HashMap<String, ChannelSlot>>>;

struct Inner {
    platform: SharedPlatform,
    pipes: Arc<dyn PipeServerFactory>,
    bus: Arc<InMemoryEventBus>,
    launcher: Launcher,
    channels: Channels,
    auth_timeout: Duration,
}

/// Opens authenticated channels to launched children.
#[derive(Clone)]
pub struct ChannelEstablisher {
    inner: Arc<Inner>,
}

impl ChannelEstablisher {
    pub fn new(
        platform: SharedPlatform,
        pipes: Arc<dyn PipeServerFactory>,
        bus: Arc<InMemoryEventBus>,
    ) -> Self {
        Self::with_auth_timeout(platform, pipes, bus, DEFAULT_AUTH_TIMEOUT)
    }

    pub fn with_auth_timeout(
        platform: SharedPlatform,
        pipes: Arc<dyn PipeServerFactory>,
        bus: Arc<InMemoryEventBus>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher: Launcher::new(platform.clone()),
                platform,
                pipes,
                bus,
                channels: Arc::new(Mutex::new(HashMap::new())),
                auth_timeout,
            }),
        }
    }

    /// Start `command` as the desktop user with a private pipe, or open the
    /// well-known pipe of `channel` when no command is given.
    ///
    /// Returns once the child is running; `connection` resolves when the
    /// client has connected.
    pub async fn start_process(
        &self,
        command: Option<&str>,
        channel: Option<&str>,
        options: StartOptions,
    ) -> Result<StartedProcess, ChannelError> {
        let pipe_name = match (command, channel) {
            (Some(_), _) => generate_pipe_name(),
            (None, Some(channel)) => channel_pipe_name(channel),
            (None, None) => return Err(ChannelError::InvalidArguments),
        };

        let mut server = self.inner.pipes.bind(&pipe_name)?;
        if !options.admin {
            self.inner.platform.grant_pipe_access(&pipe_name)?;
            // Granting access opened a client connection of its own.
            drop(server.accept().await?);
        }

        if let Some(channel) = channel {
            let mut channels = self.inner.channels.lock();
            let slot = channels
                .entry(channel.to_string())
                .or_insert_with(|| ChannelSlot {
                    connection: IpcConnection::new(channel),
                    serve_task: None,
                });
            let connection = &mut slot.connection;
            connection.pipe_name = Some(pipe_name.clone());
            connection.authenticate = options.authenticate;
            connection.admin = options.admin;
            connection.messaging = options.messaging;
            connection.process_key = options.process_key.clone();
            connection.pid = None;
            if let Some(previous) = slot.serve_task.take() {
                previous.abort();
            }
        }

        let pid = match command {
            Some(command) => {
                let execute = options
                    .execute
                    .clone()
                    .with_env(PIPE_ENV_VAR, pipe_env_value(&pipe_name));
                let pid = self.inner.launcher.execute(command, &execute)?;
                if let Some(channel) = channel {
                    self.set_expected_client(channel, pid);
                }
                Some(pid)
            }
            None => None,
        };

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(self.inner.clone().serve(
            server,
            channel.map(str::to_string),
            pid,
            options,
            tx,
        ));
        if let Some(channel) = channel {
            if let Some(slot) = self.inner.channels.lock().get_mut(channel) {
                slot.serve_task = Some(task.abort_handle());
            }
        }

        info!(pipe = %pipe_name, channel = ?channel, pid = ?pid, "Channel pipe listening");
        Ok(StartedProcess {
            pid,
            pipe_name,
            connection: Establishing { rx },
        })
    }

    /// Start a process in the user's session without a pipe.
    pub fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<Pid, ChannelError> {
        Ok(self.inner.launcher.execute(command, options)?)
    }

    /// Set the PID a channel's client must prove to be.
    pub fn set_expected_client(&self, channel: &str, pid: Pid) {
        if let Some(slot) = self.inner.channels.lock().get_mut(channel) {
            slot.connection.pid = Some(pid);
        }
    }

    /// Set the handler answering requests from a channel's client. Applies
    /// to the current session and every later one.
    pub fn register_handler(&self, channel: &str, handler: SharedHandler) {
        let mut channels = self.inner.channels.lock();
        let slot = channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelSlot {
                connection: IpcConnection::new(channel),
                serve_task: None,
            });
        slot.connection.handler = Some(handler);
    }

    /// Send a request to a channel's client and wait for the reply.
    pub async fn send_request(&self, channel: &str, request: Value) -> Result<Value, ChannelError> {
        let session = self.live_session(channel)?;
        Ok(session.send_request(request).await?)
    }

    /// Send a message to a channel's client.
    pub fn send_message(&self, channel: &str, payload: impl Into<Payload>) -> Result<(), ChannelError> {
        let session = self.live_session(channel)?;
        session
            .send_message(payload)
            .map_err(|_| ChannelError::NotConnected {
                channel: channel.to_string(),
            })
    }

    pub fn session(&self, channel: &str) -> Option<SessionHandle> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .and_then(|slot| slot.connection.live_session().cloned())
    }

    pub fn connection(&self, channel: &str) -> Option<ChannelInfo> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|slot| slot.connection.info())
    }

    pub fn connections(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .inner
            .channels
            .lock()
            .values()
            .map(|slot| slot.connection.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Stop listening on a channel and close its session.
    pub fn close_channel(&self, channel: &str) {
        let (task, session) = match self.inner.channels.lock().get_mut(channel) {
            Some(slot) => (slot.serve_task.take(), slot.connection.session.take()),
            None => return,
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(session) = session {
            session.close();
        }
        debug!(channel, "Channel closed");
    }

    /// Close every channel.
    pub fn close_all(&self) {
        let names: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        for name in names {
            self.close_channel(&name);
        }
    }

    fn live_session(&self, channel: &str) -> Result<SessionHandle, ChannelError> {
        self.session(channel).ok_or_else(|| ChannelError::NotConnected {
            channel: channel.to_string(),
        })
    }
}

// =============================================================================
// SERVING
// =============================================================================

impl Inner {
    async fn serve(
        self: Arc<Self>,
        mut server: Box<dyn PipeServer>,
        channel: Option<String>,
        pid: Option<Pid>,
        options: StartOptions,
        ready: oneshot::Sender<Result<Established, ChannelError>>,
    ) {
        if options.authenticate {
            let result = match server.accept().await {
                Ok(stream) => {
                    // One client per launch: nobody else may connect.
                    drop(server);
                    self.authenticate(stream, channel.as_deref(), pid).await
                }
                Err(e) => Err(e.into()),
            };
            let result = result.map(|(stream, early)| {
                self.attach(channel.as_deref(), stream, early, options.messaging)
            });
            if let (Err(e), Some(channel)) = (&result, &channel) {
                self.bus.emit(ServiceEvent::ChannelError {
                    channel: channel.clone(),
                    reason: e.to_string(),
                });
            }
            let _ = ready.send(result);
            return;
        }

        let mut ready = Some(ready);
        loop {
            let mut stream = match server.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e.into()));
                    }
                    return;
                }
            };
            if let Err(e) = stream.write_all(NO_CHALLENGE.as_bytes()).await {
                warn!(channel = ?channel, error = %e, "Failed to greet client");
                continue;
            }
            let established = self.attach(channel.as_deref(), stream, Vec::new(), options.messaging);
            match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Ok(established));
                }
                None => debug!(channel = ?channel, "Client reconnected"),
            }
        }
    }

    async fn authenticate(
        &self,
        stream: BoxedStream,
        channel: Option<&str>,
        pid: Option<Pid>,
    ) -> Result<(BoxedStream, Vec<u8>), ChannelError> {
        let expected = pid.or_else(|| {
            channel.and_then(|c| self.channels.lock().get(c).and_then(|slot| slot.connection.pid))
        });
        let Some(expected) = expected else {
            warn!(channel = ?channel, "Pipe connection before the client was started");
            return Err(AuthError::ClientNotStarted.into());
        };
        Ok(validate_client(self.platform.clone(), stream, expected, self.auth_timeout).await?)
    }

    fn attach(
        self: &Arc<Self>,
        channel: Option<&str>,
        stream: BoxedStream,
        early: Vec<u8>,
        messaging: bool,
    ) -> Established {
        if !messaging {
            return Established::Raw { stream, early };
        }

        let mut options = SessionOptions::default().with_initial_bytes(early);
        if let Some(channel) = channel {
            options = options
                .with_session_type(channel)
                .with_handler(Arc::new(ChannelHandler {
                    channels: self.channels.clone(),
                    channel: channel.to_string(),
                }));
        }
        let (session, events) = Session::spawn(stream, options);

        if let Some(channel) = channel {
            let previous = self.channels.lock().get_mut(channel).and_then(|slot| {
                slot.connection.session.replace(session.clone())
            });
            if let Some(previous) = previous {
                previous.close();
            }
            tokio::spawn(self.clone().pump(channel.to_string(), events));
        }
        Established::Session(session)
    }

    /// Publish a channel's session lifecycle on the bus.
    async fn pump(self: Arc<Self>, channel: String, mut events: SessionEvents) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Ready => {
                    info!(channel = %channel, "Channel connected");
                    self.bus.emit(ServiceEvent::ChannelConnected {
                        channel: channel.clone(),
                    });
                }
                SessionEvent::Message(message) => {
                    debug!(channel = %channel, %message, "Unsolicited message");
                }
                SessionEvent::Error(e) => {
                    warn!(channel = %channel, error = %e, "Channel error");
                    self.bus.emit(ServiceEvent::ChannelError {
                        channel: channel.clone(),
                        reason: e.to_string(),
                    });
                }
                SessionEvent::Closed => break,
            }
        }

        if let Some(slot) = self.channels.lock().get_mut(&channel) {
            if slot.connection.session.as_ref().is_some_and(SessionHandle::is_closed) {
                slot.connection.session = None;
            }
        }
        info!(channel = %channel, "Channel closed");
        self.bus.emit(ServiceEvent::ChannelClosed { channel });
    }
}

/// Routes a session's requests to the handler registered for its channel
/// at the time each request arrives.
struct ChannelHandler {
    channels: Channels,
    channel: String,
}

#[async_trait]
impl RequestHandler for ChannelHandler {
    async fn handle(&self, request: Map<String, Value>) -> Result<Value, HandlerError> {
        let handler = self
            .channels
            .lock()
            .get(&self.channel)
            .and_then(|slot| slot.connection.handler.clone());
        match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                debug!(channel = %self.channel, "No request handler, replying null");
                Ok(Value::Null)
            }
        }
    }
}
