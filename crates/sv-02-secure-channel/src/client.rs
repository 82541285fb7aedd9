//! Client side of a channel, as run by a launched child.

use crate::domain::challenge::{parse_challenge, take_line, Challenge};
use crate::domain::pipe_name::{pipe_name_from_env_value, PIPE_ENV_VAR};
use crate::error::AuthError;
use crate::ports::PipeStream;
use shared_types::Platform;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Full pipe name handed down by the service, if any.
pub fn pipe_name_from_env() -> Option<String> {
    std::env::var(PIPE_ENV_VAR)
        .ok()
        .and_then(|value| pipe_name_from_env_value(&value))
}

/// Answer the server's challenge and wait for `OK`.
///
/// Returns the stream and any bytes received after `OK\n`.
pub async fn answer_challenge<S: PipeStream>(
    platform: &dyn Platform,
    mut stream: S,
) -> Result<(S, Vec<u8>), AuthError> {
    let mut buffer = Vec::new();

    let line = read_line(&mut stream, &mut buffer).await?;
    match parse_challenge(&line) {
        Some(Challenge::Signal(handle)) => {
            debug!(handle = %handle, "Answering challenge");
            platform.set_event(handle)?;
        }
        Some(Challenge::None) => {}
        None => return Err(AuthError::MalformedChallenge(line)),
    }

    let line = read_line(&mut stream, &mut buffer).await?;
    if line.trim() != "OK" {
        return Err(AuthError::MalformedChallenge(line));
    }
    Ok((stream, buffer))
}

async fn read_line<S: PipeStream>(stream: &mut S, buffer: &mut Vec<u8>) -> Result<String, AuthError> {
    let mut chunk = [0u8; 128];
    loop {
        if let Some(line) = take_line(buffer) {
            return Ok(line);
        }
        match stream.read(&mut chunk).await? {
            0 => return Err(AuthError::PeerClosed),
            n => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}
