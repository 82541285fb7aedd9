//! # Client Authentication
//!
//! Proves that the process on the other end of a pipe is the one the service
//! launched. Pipe client PIDs cannot be trusted, so the service creates an
//! event, duplicates it into the expected process and sends the child's
//! handle value as a challenge. Only the expected process can signal that
//! event through that handle value.
//!
//! The wait for the event is a blocking kernel wait on `[cancel, event]`; the
//! cancel event is set when the client closes the pipe so the wait ends
//! early.

use crate::domain::challenge::{challenge_line, OK_LINE};
use crate::error::AuthError;
use crate::ports::PipeStream;
use shared_types::{OwnedHandle, Pid, ProcessAccess, SharedPlatform, WaitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Default time the client has to signal the event.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Index of the challenge event in the wait list.
const EVENT_INDEX: usize = 1;

/// Sets the cancel event if the validation future is dropped mid-wait, so
/// the blocking thread does not outlive it by the full timeout.
struct CancelGuard {
    platform: SharedPlatform,
    cancel: Arc<OwnedHandle>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.platform.set_event(self.cancel.raw());
        }
    }
}

/// Authenticate the client on `stream` as process `pid`.
///
/// On success `OK\n` has been written and the stream is returned together
/// with any bytes the client sent early (they belong to the messaging
/// session). On failure the stream is shut down.
pub async fn validate_client<S: PipeStream>(
    platform: SharedPlatform,
    mut stream: S,
    pid: Pid,
    timeout: Duration,
) -> Result<(S, Vec<u8>), AuthError> {
    match exchange(&platform, &mut stream, pid, timeout).await {
        Ok(early) => {
            stream.write_all(OK_LINE.as_bytes()).await?;
            stream.flush().await?;
            info!(pid = %pid, "Client authenticated");
            Ok((stream, early))
        }
        Err(e) => {
            warn!(pid = %pid, error = %e, "Client authentication failed");
            let _ = stream.shutdown().await;
            Err(e)
        }
    }
}

async fn exchange<S: PipeStream>(
    platform: &SharedPlatform,
    stream: &mut S,
    pid: Pid,
    timeout: Duration,
) -> Result<Vec<u8>, AuthError> {
    let cancel = Arc::new(OwnedHandle::new(
        platform.clone(),
        platform.create_event(false)?,
    ));
    let event = OwnedHandle::new(platform.clone(), platform.create_event(false)?);

    let remote = {
        let process = OwnedHandle::new(
            platform.clone(),
            platform.open_process(pid, ProcessAccess::DuplicateHandle)?,
        );
        platform.duplicate_handle_into(event.raw(), process.raw())?
    };

    debug!(pid = %pid, handle = %remote, "Sending challenge");
    stream.write_all(challenge_line(remote).as_bytes()).await?;
    stream.flush().await?;

    let mut guard = CancelGuard {
        platform: platform.clone(),
        cancel: cancel.clone(),
        armed: true,
    };

    let waiter = {
        let platform = platform.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = platform.wait_for_any(&[cancel.raw(), event.raw()], Some(timeout));
            drop(event);
            outcome
        })
    };
    tokio::pin!(waiter);

    let mut early = Vec::new();
    let mut buf = [0u8; 256];
    let mut peer_open = true;
    let outcome = loop {
        tokio::select! {
            joined = &mut waiter => break joined,
            read = stream.read(&mut buf), if peer_open => match read {
                Ok(n) if n > 0 => early.extend_from_slice(&buf[..n]),
                _ => {
                    peer_open = false;
                    platform.set_event(cancel.raw())?;
                }
            },
        }
    };
    guard.armed = false;

    match outcome.map_err(|_| AuthError::WaitAborted)?? {
        WaitOutcome::Signaled(EVENT_INDEX) => Ok(early),
        WaitOutcome::Signaled(_) => Err(AuthError::PeerClosed),
        WaitOutcome::TimedOut => Err(AuthError::Timeout),
    }
}
