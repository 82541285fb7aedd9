//! # sv-01-pipe-messaging
//!
//! Framed JSON messaging over any duplex byte stream (named pipe, socket,
//! in-memory duplex).
//!
//! ## Overview
//!
//! - **Framing**: `u16` big-endian length prefix, UTF-8 payload
//! - **Handshake**: optional session-type string exchanged as the first frame
//! - **Envelope**: `request` / `response` / `error` ids correlate requests with
//!   replies; the requester gets a future per request
//!
//! ## Example
//!
//! ```rust,ignore
//! use sv_01_pipe_messaging::{Session, SessionOptions};
//!
//! let (session, mut events) = Session::spawn(stream, SessionOptions::default()
//!     .with_session_type("gpii"));
//! let status = session.send_request(json!({ "requestType": "status" })).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod session;

pub use codec::{encode_frame, FrameAssembler, LENGTH_PREFIX_BYTES, MAX_PAYLOAD_LEN};
pub use envelope::Envelope;
pub use error::{FrameError, RequestError, SessionError};
pub use handler::{handler_fn, HandlerError, RequestHandler, SharedHandler};
pub use session::{Payload, Session, SessionEvent, SessionEvents, SessionHandle, SessionOptions};
