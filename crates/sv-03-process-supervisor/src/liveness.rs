//! PID-reuse-safe liveness.
//!
//! Windows recycles PIDs quickly. A PID that exists is only "our" process
//! if its creation time matches the one captured when it was started.

use shared_types::{CreationToken, Pid, Platform};
use tracing::debug;

/// Creation time of `pid`, `None` if there is no such process.
pub fn process_creation_time(platform: &dyn Platform, pid: Pid) -> Option<CreationToken> {
    match platform.process_creation_time(pid) {
        Ok(token) => token,
        Err(e) => {
            debug!(pid = %pid, error = %e, "No creation time");
            None
        }
    }
}

/// Whether `pid` is running and, when `creation` is given, is still the
/// process that had that creation time.
pub fn is_process_running(
    platform: &dyn Platform,
    pid: Pid,
    creation: Option<CreationToken>,
) -> bool {
    if pid.0 == 0 {
        return false;
    }

    let exists = platform.process_exists(pid);
    let current = process_creation_time(platform, pid);

    if !exists {
        if current.is_some() {
            // Someone still holds a handle to the dead process.
            debug!(pid = %pid, "Possible process handle leak");
        }
        return false;
    }

    match (creation, current) {
        (Some(expected), Some(current)) => expected == current,
        (_, current) => current.is_some(),
    }
}
