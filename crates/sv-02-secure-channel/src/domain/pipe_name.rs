//! Pipe naming and the environment contract with launched children.
//!
//! A child started with a pipe receives `GPII_SERVICE_PIPE=pipe:<suffix>`
//! and rebuilds the full name by prepending [`PIPE_PREFIX`]. Keeping the
//! name out of the command line keeps it out of process listings.

use rand::RngCore;

/// Namespace every pipe of the service lives in.
pub const PIPE_PREFIX: &str = r"\\.\pipe\gpii-";

/// Environment variable carrying the pipe name to the child.
pub const PIPE_ENV_VAR: &str = "GPII_SERVICE_PIPE";

/// Marker in front of the suffix in [`PIPE_ENV_VAR`].
const ENV_VALUE_SCHEME: &str = "pipe:";

/// Random bytes in a generated name.
pub const PIPE_NAME_ENTROPY_BYTES: usize = 18;

/// A fresh pipe name with a high-entropy random suffix.
pub fn generate_pipe_name() -> String {
    let mut bytes = [0u8; PIPE_NAME_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{PIPE_PREFIX}{}", hex::encode(bytes))
}

/// The well-known pipe name of a named channel.
pub fn channel_pipe_name(channel: &str) -> String {
    format!("{PIPE_PREFIX}{channel}")
}

/// Value of [`PIPE_ENV_VAR`] for a pipe.
pub fn pipe_env_value(pipe_name: &str) -> String {
    let suffix = pipe_name.strip_prefix(PIPE_PREFIX).unwrap_or(pipe_name);
    format!("{ENV_VALUE_SCHEME}{suffix}")
}

/// Rebuild the full pipe name from a [`PIPE_ENV_VAR`] value.
pub fn pipe_name_from_env_value(value: &str) -> Option<String> {
    value
        .strip_prefix(ENV_VALUE_SCHEME)
        .filter(|suffix| !suffix.is_empty())
        .map(|suffix| format!("{PIPE_PREFIX}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique_and_prefixed() {
        let a = generate_pipe_name();
        let b = generate_pipe_name();

        assert_ne!(a, b);
        assert!(a.starts_with(PIPE_PREFIX));
        assert_eq!(a.len(), PIPE_PREFIX.len() + PIPE_NAME_ENTROPY_BYTES * 2);
    }

    #[test]
    fn test_env_value_round_trip() {
        let name = generate_pipe_name();
        let value = pipe_env_value(&name);

        assert!(value.starts_with("pipe:"));
        assert!(!value.contains(r"\\.\pipe"));
        assert_eq!(pipe_name_from_env_value(&value), Some(name));
    }

    #[test]
    fn test_env_value_rejects_garbage() {
        assert_eq!(pipe_name_from_env_value("gpii"), None);
        assert_eq!(pipe_name_from_env_value("pipe:"), None);
    }

    #[test]
    fn test_channel_pipe_name() {
        assert_eq!(channel_pipe_name("gpii"), r"\\.\pipe\gpii-gpii");
    }
}
