//! # Platform Capability Provider
//!
//! The small set of OS capabilities the service consumes. The Windows
//! implementation lives in the runtime crate; tests use
//! [`crate::testing::SimulatedPlatform`].
//!
//! All calls are synchronous. [`Platform::wait_for_any`] blocks the calling
//! thread and must only be called from a blocking-pool thread.

use crate::entities::{
    CreationToken, LaunchRequest, LaunchedProcess, Pid, ProcessAccess, RawHandle, WaitOutcome,
};
use crate::errors::PlatformResult;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Shared, dynamically dispatched platform.
pub type SharedPlatform = Arc<dyn Platform>;

/// OS capabilities consumed by the channel establisher and the supervisor.
pub trait Platform: Send + Sync + 'static {
    // -------------------------------------------------------------------------
    // Handles and events
    // -------------------------------------------------------------------------

    /// Open a process by PID with the requested access right.
    fn open_process(&self, pid: Pid, access: ProcessAccess) -> PlatformResult<RawHandle>;

    /// Close a handle owned by this process.
    fn close_handle(&self, handle: RawHandle) -> PlatformResult<()>;

    /// Duplicate `source` (owned by this process) into the handle table of
    /// the process referenced by `target_process`. Returns the handle value
    /// as seen by the target.
    fn duplicate_handle_into(
        &self,
        source: RawHandle,
        target_process: RawHandle,
    ) -> PlatformResult<RawHandle>;

    /// Create an unsignalled event.
    fn create_event(&self, manual_reset: bool) -> PlatformResult<RawHandle>;

    /// Signal an event.
    fn set_event(&self, event: RawHandle) -> PlatformResult<()>;

    /// Block until any of `handles` is signalled or the timeout elapses.
    /// `None` waits forever.
    fn wait_for_any(
        &self,
        handles: &[RawHandle],
        timeout: Option<Duration>,
    ) -> PlatformResult<WaitOutcome>;

    // -------------------------------------------------------------------------
    // Process information
    // -------------------------------------------------------------------------

    /// Creation time of the process currently known by `pid`, or `None` if
    /// no process object for that PID can be opened.
    fn process_creation_time(&self, pid: Pid) -> PlatformResult<Option<CreationToken>>;

    /// Liveness probe. True if a running process has this PID.
    fn process_exists(&self, pid: Pid) -> bool;

    /// Terminate the process with this PID.
    fn terminate_process(&self, pid: Pid) -> PlatformResult<()>;

    // -------------------------------------------------------------------------
    // Users and launching
    // -------------------------------------------------------------------------

    /// True when running under the service control manager.
    fn is_service(&self) -> bool;

    /// Primary token of the interactive desktop user when running as a
    /// service, or this process's own token otherwise. `Ok(None)` when no
    /// user is logged on to the console session.
    fn desktop_user_token(&self) -> PlatformResult<Option<RawHandle>>;

    /// The elevated token linked to `token`.
    fn elevated_token(&self, token: RawHandle) -> PlatformResult<RawHandle>;

    /// Environment block for the user, as `NAME=value` entries. `None` means
    /// the environment of this process.
    fn user_environment(&self, token: Option<RawHandle>) -> PlatformResult<Vec<String>>;

    /// Create a process with `token`, or as the current user when `None`.
    fn create_process_as_user(
        &self,
        token: Option<RawHandle>,
        request: &LaunchRequest,
    ) -> PlatformResult<LaunchedProcess>;

    /// Add the desktop user to the DACL of the named pipe. This opens a
    /// client connection to the pipe, modifies it and closes it again; the
    /// server side sees one connection that carries no data.
    fn grant_pipe_access(&self, pipe_name: &str) -> PlatformResult<()>;
}

// =============================================================================
// OWNED HANDLE
// =============================================================================

/// A handle that is closed when the guard is dropped.
pub struct OwnedHandle {
    platform: SharedPlatform,
    raw: RawHandle,
}

impl OwnedHandle {
    /// Take ownership of `raw`.
    #[must_use]
    pub fn new(platform: SharedPlatform, raw: RawHandle) -> Self {
        Self { platform, raw }
    }

    /// The raw handle value.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Give up ownership without closing.
    pub fn into_raw(self) -> RawHandle {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.raw).finish()
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = self.platform.close_handle(self.raw) {
            warn!(handle = self.raw.0, error = %e, "Failed to close handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedPlatform;

    #[test]
    fn test_owned_handle_closes_on_drop() {
        let sim = SimulatedPlatform::new();
        let platform: SharedPlatform = Arc::new(sim.clone());
        let own = sim.current_pid();

        let event = platform.create_event(false).unwrap();
        assert_eq!(sim.open_handle_count(own), 1);

        drop(OwnedHandle::new(platform.clone(), event));
        assert_eq!(sim.open_handle_count(own), 0);
    }

    #[test]
    fn test_into_raw_keeps_handle_open() {
        let sim = SimulatedPlatform::new();
        let platform: SharedPlatform = Arc::new(sim.clone());

        let event = platform.create_event(false).unwrap();
        let raw = OwnedHandle::new(platform.clone(), event).into_raw();
        assert_eq!(raw, event);
        assert_eq!(sim.open_handle_count(sim.current_pid()), 1);
        platform.close_handle(raw).unwrap();
    }
}
