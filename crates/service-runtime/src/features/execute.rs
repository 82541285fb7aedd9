//! # Execute Requests
//!
//! The companion client can have the service run a command for it. The
//! command runs in the service's own context, without a shell, so
//! arguments need no quoting.
//!
//! | Request | Reply |
//! |---------|-------|
//! | default | `{pid}` as soon as the process has started |
//! | `wait` | `{code, signal}` once it has ended |
//! | `capture` (implies `wait`) | `{code, signal, output: {stdout, stderr}}` |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bytes of each output stream kept by `capture`. The rest is read and
/// dropped so the process never blocks on a full pipe.
pub const MAX_CAPTURED_OUTPUT: usize = 0xfffff;

/// Body of an `execute` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    pub command: String,
    pub args: Vec<String>,
    pub options: ExecuteRequestOptions,
    pub wait: bool,
    pub capture: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecuteRequestOptions {
    pub cwd: Option<PathBuf>,
    /// Replaces the whole environment when present.
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("unable to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("waiting for {command} failed: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// Reply to an `execute` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExecuteResult {
    Started {
        pid: Option<u32>,
    },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<CapturedOutput>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run the requested command.
pub async fn execute(request: &ExecuteRequest) -> Result<ExecuteResult, ExecuteError> {
    let wait = request.wait || request.capture;

    let mut command = Command::new(&request.command);
    command.args(&request.args).stdin(Stdio::null());
    if let Some(dir) = &request.options.cwd {
        command.current_dir(dir);
    }
    if let Some(env) = &request.options.env {
        command.env_clear().envs(env);
    }
    if request.capture {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let mut child = command.spawn().map_err(|source| ExecuteError::Spawn {
        command: request.command.clone(),
        source,
    })?;
    let pid = child.id();
    info!(command = %request.command, pid = ?pid, wait, "Executing for the client");

    if !wait {
        let name = request.command.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(command = %name, code = ?status.code(), "Executed process ended"),
                Err(e) => warn!(command = %name, error = %e, "Lost track of executed process"),
            }
        });
        return Ok(ExecuteResult::Started { pid });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, stdout, stderr) =
        tokio::join!(child.wait(), read_capped(stdout), read_capped(stderr));
    let status = status.map_err(|source| ExecuteError::Wait {
        command: request.command.clone(),
        source,
    })?;
    debug!(command = %request.command, code = ?status.code(), "Executed process ended");

    Ok(ExecuteResult::Exited {
        code: status.code(),
        signal: exit_signal(&status),
        output: request.capture.then_some(CapturedOutput { stdout, stderr }),
    })
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURED_OUTPUT - kept.len();
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
