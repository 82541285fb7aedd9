//! # Core Domain Entities
//!
//! Identifiers and opaque OS-object references shared by every crate.
//!
//! ## Clusters
//!
//! - **Processes**: `Pid`, `CreationToken`
//! - **Kernel objects**: `RawHandle`, `ProcessAccess`, `WaitOutcome`
//! - **Launching**: `LaunchRequest`, `LaunchedProcess`
//! - **Sessions**: `SessionChange`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// CLUSTER A: PROCESSES
// =============================================================================

/// An operating-system process identifier.
///
/// PIDs are recycled aggressively by Windows; a `Pid` alone never proves the
/// identity of a process. Pair it with a [`CreationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque value identifying when a process object was created.
///
/// Only equality is meaningful. Two different processes that shared a PID
/// have different tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreationToken(pub u64);

// =============================================================================
// CLUSTER B: KERNEL OBJECTS
// =============================================================================

/// The raw integer value of a kernel handle.
///
/// Values are only meaningful inside the handle table of the process that
/// owns them. Ownership and closing are tracked by [`crate::OwnedHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access rights requested when opening a process by PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAccess {
    /// Right to duplicate handles into the process (`PROCESS_DUP_HANDLE`).
    DuplicateHandle,
    /// Right to wait on the process (`SYNCHRONIZE`).
    Synchronize,
    /// Right to read basic information such as creation time.
    QueryLimited,
}

/// Result of a wait on several handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The handle at this index (in the slice passed to the wait) is signalled.
    Signaled(usize),
    /// The timeout elapsed first.
    TimedOut,
}

// =============================================================================
// CLUSTER C: LAUNCHING
// =============================================================================

/// Everything the platform needs to create a process for a user.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Full command line.
    pub command: String,
    /// Environment block as `NAME=value` entries.
    pub environment: Vec<String>,
    /// Working directory for the new process.
    pub current_dir: Option<PathBuf>,
    /// Create the process with its own visible console.
    pub new_console: bool,
    /// Let the child inherit inheritable handles.
    pub inherit_handles: bool,
}

/// Handles returned by a successful launch. Both must be closed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedProcess {
    /// PID of the new process.
    pub pid: Pid,
    /// Handle to the new process.
    pub process_handle: RawHandle,
    /// Handle to the primary thread.
    pub thread_handle: RawHandle,
}

// =============================================================================
// CLUSTER D: SESSIONS
// =============================================================================

/// Kinds of interactive-session change reported by the service control
/// manager (`WTS_*` notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionChange {
    ConsoleConnect,
    ConsoleDisconnect,
    RemoteConnect,
    RemoteDisconnect,
    SessionLogon,
    SessionLogoff,
    SessionLock,
    SessionUnlock,
    SessionRemoteControl,
    SessionCreate,
    SessionTerminate,
}

impl SessionChange {
    /// Parse the kebab-case name used by the service control layer.
    pub fn from_name(name: &str) -> Option<Self> {
        let change = match name {
            "console-connect" => Self::ConsoleConnect,
            "console-disconnect" => Self::ConsoleDisconnect,
            "remote-connect" => Self::RemoteConnect,
            "remote-disconnect" => Self::RemoteDisconnect,
            "session-logon" => Self::SessionLogon,
            "session-logoff" => Self::SessionLogoff,
            "session-lock" => Self::SessionLock,
            "session-unlock" => Self::SessionUnlock,
            "session-remote" => Self::SessionRemoteControl,
            "session-create" => Self::SessionCreate,
            "session-terminate" => Self::SessionTerminate,
            _ => return None,
        };
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_change_from_name() {
        assert_eq!(
            SessionChange::from_name("session-logon"),
            Some(SessionChange::SessionLogon)
        );
        assert_eq!(
            SessionChange::from_name("session-remote"),
            Some(SessionChange::SessionRemoteControl)
        );
        assert_eq!(SessionChange::from_name("nonsense"), None);
    }

    #[test]
    fn test_display_values() {
        assert_eq!(Pid(42).to_string(), "42");
        assert_eq!(RawHandle(0x1f4).to_string(), "500");
    }
}
