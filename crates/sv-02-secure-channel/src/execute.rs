//! # Launching in the User's Session
//!
//! A service runs as LocalSystem in session 0. Children must run on the
//! interactive desktop, as the logged-on user, with that user's environment.

use crate::domain::launch::{merge_environment, ExecuteOptions};
use crate::error::LaunchError;
use shared_types::{LaunchRequest, OwnedHandle, Pid, SharedPlatform};
use tracing::{error, info, warn};

/// Starts processes as the desktop user.
#[derive(Clone)]
pub struct Launcher {
    platform: SharedPlatform,
}

impl Launcher {
    pub fn new(platform: SharedPlatform) -> Self {
        Self { platform }
    }

    /// Start `command` as the logged-on user and return its PID.
    ///
    /// Every token, process and thread handle is closed before returning.
    pub fn execute(&self, command: &str, options: &ExecuteOptions) -> Result<Pid, LaunchError> {
        let user_token = self
            .platform
            .desktop_user_token()?
            .map(|raw| OwnedHandle::new(self.platform.clone(), raw));

        if user_token.is_none() {
            if !options.always_run {
                error!(command, "Unable to start process: no desktop user");
                return Err(LaunchError::NoDesktopUser);
            }
            warn!(command, "No desktop user, starting as the service account");
        }

        let elevated_token = match (&user_token, options.elevated) {
            (Some(token), true) => match self.platform.elevated_token(token.raw()) {
                Ok(raw) => Some(OwnedHandle::new(self.platform.clone(), raw)),
                Err(e) => {
                    warn!(command, error = %e, "Unable to get elevated token, using the user token");
                    None
                }
            },
            _ => None,
        };

        let environment = self
            .platform
            .user_environment(user_token.as_ref().map(OwnedHandle::raw))?;
        let request = LaunchRequest {
            command: command.to_string(),
            environment: merge_environment(environment, &options.env),
            current_dir: options.current_dir.clone(),
            new_console: options.new_console,
            inherit_handles: options.inherit_handles,
        };

        let run_as = elevated_token.as_ref().or(user_token.as_ref());
        let launched = self
            .platform
            .create_process_as_user(run_as.map(OwnedHandle::raw), &request)?;
        drop(OwnedHandle::new(self.platform.clone(), launched.thread_handle));
        drop(OwnedHandle::new(self.platform.clone(), launched.process_handle));

        info!(command, pid = %launched.pid, elevated = elevated_token.is_some(), "Started process");
        Ok(launched.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::testing::{SimulatedPlatform, SERVICE_PID};
    use std::sync::Arc;

    fn launcher(sim: &SimulatedPlatform) -> Launcher {
        Launcher::new(Arc::new(sim.clone()))
    }

    #[test]
    fn test_runs_as_desktop_user_with_env_overlay() {
        let sim = SimulatedPlatform::new();
        let options = ExecuteOptions::default().with_env("GPII_SERVICE_PIPE", "pipe:abc");

        let pid = launcher(&sim).execute("gpii.exe", &options).unwrap();

        let launch = &sim.launches()[0];
        assert_eq!(launch.pid, pid);
        assert_eq!(launch.user.as_deref(), Some("user"));
        assert!(!launch.elevated);
        assert!(launch.request.new_console);
        assert_eq!(launch.env_var("GPII_SERVICE_PIPE"), Some("pipe:abc"));
        assert_eq!(launch.env_var("USERNAME"), Some("user"));
        assert_eq!(sim.open_handle_count(SERVICE_PID), 0);
    }

    #[test]
    fn test_no_desktop_user_is_an_error() {
        let sim = SimulatedPlatform::new();
        sim.set_desktop_user(None);

        let result = launcher(&sim).execute("gpii.exe", &ExecuteOptions::default());

        assert_eq!(result, Err(LaunchError::NoDesktopUser));
        assert!(sim.launches().is_empty());
    }

    #[test]
    fn test_always_run_without_user_uses_service_account() {
        let sim = SimulatedPlatform::new();
        sim.set_desktop_user(None);

        launcher(&sim)
            .execute("gpii.exe", &ExecuteOptions::default().always_run(true))
            .unwrap();

        let launch = &sim.launches()[0];
        assert_eq!(launch.user, None);
        assert_eq!(launch.env_var("USERNAME"), Some("SYSTEM"));
    }

    #[test]
    fn test_elevated_token_and_fallback() {
        let sim = SimulatedPlatform::new();
        let options = ExecuteOptions::default().elevated(true);

        launcher(&sim).execute("a.exe", &options).unwrap();
        sim.set_elevation_available(false);
        launcher(&sim).execute("b.exe", &options).unwrap();

        let launches = sim.launches();
        assert!(launches[0].elevated);
        assert!(!launches[1].elevated);
        assert_eq!(launches[1].user.as_deref(), Some("user"));
        assert_eq!(sim.open_handle_count(SERVICE_PID), 0);
    }

    #[test]
    fn test_launch_failure_closes_tokens() {
        let sim = SimulatedPlatform::new();
        sim.set_fail_launch(true);

        let result = launcher(&sim).execute("gpii.exe", &ExecuteOptions::default());

        assert!(matches!(result, Err(LaunchError::Platform(_))));
        assert_eq!(sim.open_handle_count(SERVICE_PID), 0);
    }
}
