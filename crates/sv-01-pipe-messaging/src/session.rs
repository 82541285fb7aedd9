//! # Message Session
//!
//! Wraps one duplex byte stream. A reader task owns the read half, the
//! frame assembler and dispatch; a writer task owns the write half and
//! writes frames in the order they were queued.
//!
//! ```text
//!            ┌──────── reader task ────────┐
//!  stream ──►│ FrameAssembler → handshake  │──► SessionEvent (Ready/Message/Error/Closed)
//!            │   → Envelope dispatch       │──► pending[id].send(reply)
//!            └─────────────┬───────────────┘
//!                          │ requests → spawned handler → reply frame
//!            ┌──────── writer task ────────┐
//!  stream ◄──│ queued frames, FIFO         │◄── SessionHandle::send_*
//!            └─────────────────────────────┘
//! ```
//!
//! Closing (explicitly, on EOF, or on any transport error) rejects every
//! pending request with [`RequestError::SessionClosed`] and emits
//! [`SessionEvent::Closed`] last.

use crate::codec::{encode_frame, FrameAssembler};
use crate::envelope::{error_message, request_message, response_message, Envelope};
use crate::error::{FrameError, RequestError, SessionError};
use crate::handler::SharedHandler;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Read buffer size.
const READ_CHUNK: usize = 4096;

type ReplySlot = oneshot::Sender<Result<Value, RequestError>>;

/// Notifications from a session, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The handshake completed (or none was configured).
    Ready,
    /// A JSON message arrived after the handshake.
    Message(Value),
    /// A transport error; the session is closing.
    Error(SessionError),
    /// The session is closed. Always the last event.
    Closed,
}

/// Receiver for [`SessionEvent`]s.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Outbound payload for [`SessionHandle::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as raw UTF-8.
    Text(String),
    /// Sent as serialized JSON.
    Json(Value),
}

impl Payload {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Options for [`Session::spawn`].
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Sent as the first frame and expected as the first frame received.
    pub session_type: Option<String>,
    /// Answers incoming requests. Without one, requests get a `null` reply.
    pub handler: Option<SharedHandler>,
    /// Bytes already read from the stream before the session took it over.
    pub initial_bytes: Vec<u8>,
}

impl SessionOptions {
    #[must_use]
    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_initial_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.initial_bytes = bytes;
        self
    }
}

struct Pending {
    closed: bool,
    slots: HashMap<String, ReplySlot>,
}

struct Shared {
    session_type: Option<String>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<Pending>,
    close: watch::Sender<bool>,
}

impl Shared {
    fn request_close(&self) {
        self.close.send_replace(true);
    }

    /// Mark closed and reject everything still waiting for a reply.
    fn finish(&self) {
        let slots: Vec<ReplySlot> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.slots.drain().map(|(_, slot)| slot).collect()
        };
        if !slots.is_empty() {
            debug!(count = slots.len(), "Rejecting pending requests on close");
        }
        for slot in slots {
            let _ = slot.send(Err(RequestError::SessionClosed));
        }
        self.request_close();
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_type", &self.shared.session_type)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Queue a frame. Fire-and-forget.
    pub fn send_message(&self, payload: impl Into<Payload>) -> Result<(), SessionError> {
        let frame = encode_frame(&payload.into().into_bytes())?;
        if *self.shared.close.borrow() {
            return Err(SessionError::Closed);
        }
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| SessionError::Closed)
    }

    /// Send a request and wait for the matching reply.
    ///
    /// `request` must be a JSON object; a fresh random id is added to it.
    /// There is no timeout: the future settles when a reply arrives or the
    /// session closes.
    pub async fn send_request(&self, request: Value) -> Result<Value, RequestError> {
        let Value::Object(fields) = request else {
            return Err(RequestError::InvalidPayload);
        };

        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(RequestError::SessionClosed);
            }
            pending.slots.insert(id.clone(), tx);
        }

        if let Err(e) = self.send_message(request_message(&id, fields)) {
            self.shared.pending.lock().slots.remove(&id);
            return Err(e.into());
        }
        debug!(request = %id, "Request sent");

        rx.await.unwrap_or(Err(RequestError::SessionClosed))
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.shared.request_close();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.close.borrow()
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().slots.len()
    }

    pub fn session_type(&self) -> Option<&str> {
        self.shared.session_type.as_deref()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut close = self.shared.close.subscribe();
        // Err means the sender is gone, which also means closed.
        let _ = close.wait_for(|closed| *closed).await;
    }
}

/// Entry point for wrapping a stream.
pub struct Session;

impl Session {
    /// Wrap `stream` and start the reader and writer tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<S>(stream: S, options: SessionOptions) -> (SessionHandle, SessionEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(false);

        let handle = SessionHandle {
            shared: Arc::new(Shared {
                session_type: options.session_type.clone(),
                outbound: outbound_tx,
                pending: Mutex::new(Pending {
                    closed: false,
                    slots: HashMap::new(),
                }),
                close: close_tx,
            }),
        };

        match &options.session_type {
            Some(session_type) => {
                if let Err(e) = handle.send_message(Payload::Text(session_type.clone())) {
                    warn!(error = %e, "Failed to queue session type");
                }
            }
            None => {
                let _ = events_tx.send(SessionEvent::Ready);
            }
        }

        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            handle.shared.clone(),
            events_tx.clone(),
        ));

        let dispatcher = Dispatcher {
            handle: handle.clone(),
            expected_type: options.session_type,
            handshake_done: handle.shared.session_type.is_none(),
            handler: options.handler,
            events: events_tx,
            assembler: FrameAssembler::new(),
        };
        tokio::spawn(read_loop(reader, dispatcher, options.initial_bytes));

        (handle, events_rx)
    }
}

// =============================================================================
// READER
// =============================================================================

struct Dispatcher {
    handle: SessionHandle,
    expected_type: Option<String>,
    handshake_done: bool,
    handler: Option<SharedHandler>,
    events: mpsc::UnboundedSender<SessionEvent>,
    assembler: FrameAssembler,
}

impl Dispatcher {
    fn emit(&self, event: SessionEvent) {
        // The owner may have stopped listening; the session keeps working.
        let _ = self.events.send(event);
    }

    /// Feed received bytes. Returns false when the session must close.
    fn on_bytes(&mut self, bytes: &[u8]) -> bool {
        let frames = match self.assembler.push(bytes) {
            Ok(frames) => frames,
            Err(e) => return self.malformed(e),
        };
        if !frames.into_iter().all(|frame| self.on_frame(frame)) {
            return false;
        }
        match self.assembler.take_error() {
            Some(e) => self.malformed(e),
            None => true,
        }
    }

    fn malformed(&self, e: FrameError) -> bool {
        warn!(error = %e, "Dropping session on malformed frame");
        self.emit(SessionEvent::Error(e.into()));
        false
    }

    fn on_frame(&mut self, frame: String) -> bool {
        if !self.handshake_done {
            if Some(frame.as_str()) == self.expected_type.as_deref() {
                self.handshake_done = true;
                debug!(session_type = %frame, "Session ready");
                self.emit(SessionEvent::Ready);
                return true;
            }
            warn!(received = %frame, "Unexpected session type");
            self.emit(SessionEvent::Error(SessionError::SessionTypeMismatch {
                received: frame,
            }));
            return false;
        }

        let message: Value = match serde_json::from_str(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping session on malformed message");
                self.emit(SessionEvent::Error(SessionError::InvalidJson(e.to_string())));
                return false;
            }
        };

        let envelope = Envelope::parse(&message);
        self.emit(SessionEvent::Message(message));

        match envelope {
            Envelope::Request { id, fields } => self.dispatch_request(id, fields),
            Envelope::Response { id, data } => self.settle(&id, Ok(data)),
            Envelope::Error { id, data } => self.settle(&id, Err(RequestError::Rejected(data))),
            Envelope::Other => {}
        }
        true
    }

    fn dispatch_request(&self, id: String, fields: serde_json::Map<String, Value>) {
        let handle = self.handle.clone();
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let reply = match handler {
                Some(handler) => match handler.handle(fields).await {
                    Ok(data) => response_message(&id, data),
                    Err(err) => {
                        debug!(request = %id, error = %err, "Request handler failed");
                        error_message(&id, err.into_data())
                    }
                },
                None => response_message(&id, Value::Null),
            };

            if let Err(e) = handle.send_message(reply) {
                warn!(request = %id, error = %e, "Failed to send reply");
                let fallback = error_message(&id, json!({ "message": e.to_string() }));
                let _ = handle.send_message(fallback);
            }
        });
    }

    fn settle(&self, id: &str, result: Result<Value, RequestError>) {
        let slot = self.handle.shared.pending.lock().slots.remove(id);
        match slot {
            Some(slot) => {
                let _ = slot.send(result);
            }
            None => debug!(request = %id, "Ignoring reply for unknown request"),
        }
    }
}

async fn read_loop<R>(mut reader: R, mut dispatcher: Dispatcher, initial_bytes: Vec<u8>)
where
    R: AsyncRead + Unpin,
{
    let mut close = dispatcher.handle.shared.close.subscribe();
    let mut open = initial_bytes.is_empty() || dispatcher.on_bytes(&initial_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    while open && !*close.borrow_and_update() {
        tokio::select! {
            _ = close.changed() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("Session stream ended");
                    open = false;
                }
                Ok(n) => open = dispatcher.on_bytes(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "Session read failed");
                    dispatcher.emit(SessionEvent::Error(SessionError::Io(e.to_string())));
                    open = false;
                }
            },
        }
    }

    dispatcher.handle.shared.finish();
    dispatcher.emit(SessionEvent::Closed);
}

// =============================================================================
// WRITER
// =============================================================================

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut close = shared.close.subscribe();

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(error = %e, "Session write failed");
                    let _ = events.send(SessionEvent::Error(SessionError::Io(e.to_string())));
                    shared.request_close();
                    return;
                }
            }
            _ = async { close.wait_for(|closed| *closed).await.map(|_| ()) } => break,
        }
    }

    // Flush what was queued before the close, then end our side.
    while let Ok(frame) = outbound.try_recv() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
