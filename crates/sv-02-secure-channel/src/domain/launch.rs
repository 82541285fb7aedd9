//! Options for starting a process in the desktop user's session.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// How [`crate::Launcher::execute`] starts a process.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Start even when nobody is logged on, as the service's own account.
    pub always_run: bool,
    /// Use the user's elevated token when one is available.
    pub elevated: bool,
    /// Variables added to the user's environment, replacing any of the same name.
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub new_console: bool,
    pub inherit_handles: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            always_run: false,
            elevated: false,
            env: BTreeMap::new(),
            current_dir: None,
            new_console: true,
            inherit_handles: false,
        }
    }
}

impl ExecuteOptions {
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    #[must_use]
    pub fn always_run(mut self, always_run: bool) -> Self {
        self.always_run = always_run;
        self
    }
}

/// Apply `overlay` to a `KEY=value` environment block. Names compare
/// case-insensitively, as Windows does.
pub fn merge_environment(base: Vec<String>, overlay: &BTreeMap<String, String>) -> Vec<String> {
    let mut merged: Vec<String> = base
        .into_iter()
        .filter(|entry| {
            let name = entry.split_once('=').map_or(entry.as_str(), |(name, _)| name);
            !overlay.keys().any(|key| key.eq_ignore_ascii_case(name))
        })
        .collect();
    merged.extend(overlay.iter().map(|(key, value)| format!("{key}={value}")));
    merged
}
