//! # Service Configuration
//!
//! Unified configuration for the supervisor, the channels and the runtime.
//!
//! The file is JSON with camelCase names. Every section has defaults, so an
//! empty object is a valid (if idle) configuration. `%NAME%` references in
//! process commands, environment values and working directories are
//! expanded from the service's own environment when loaded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sv_03_process_supervisor::{FailureAttribution, ProcessConfig, RestartPolicy, SupervisorConfig};
use thiserror::Error;
use tracing::{info, warn};

/// Path of the configuration file.
pub const CONFIG_ENV_VAR: &str = "GPII_SERVICE_CONFIG";

/// Overrides `logging.level`.
pub const LOG_LEVEL_ENV_VAR: &str = "GPII_LOG_LEVEL";

/// Overrides `ipc.authTimeoutSecs`.
pub const AUTH_TIMEOUT_ENV_VAR: &str = "GPII_AUTH_TIMEOUT_SECS";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Processes to run in the desktop session, by key.
    pub processes: BTreeMap<String, ProcessConfig>,
    pub logging: LoggingConfig,
    pub ipc: IpcConfig,
    /// The companion client behind the main channel.
    pub client: ClientConfig,
    pub supervisor: SupervisorSection,
    pub shutdown: ShutdownConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpcConfig {
    /// Seconds a launched child has to answer the challenge.
    pub auth_timeout_secs: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 30,
        }
    }
}

impl IpcConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Companion client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Channel the client connects on.
    pub channel: String,
    /// Seconds the client has to report that it is running.
    pub status_timeout_secs: u64,
    /// Site secrets (`clientCredentials` and signing keys). Read on every
    /// use, since it can be installed or replaced while the service runs.
    pub secret_file: Option<PathBuf>,
    /// Site configuration holding the metrics switch. The first file that
    /// loads wins.
    #[serde(deserialize_with = "one_or_many")]
    pub site_config_file: Vec<PathBuf>,
    /// What each metrics switch value means for the client.
    pub gpii_config: Option<MetricsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: "gpii".to_string(),
            status_timeout_secs: 120,
            secret_file: None,
            site_config_file: Vec::new(),
            gpii_config: None,
        }
    }
}

/// Maps a metrics switch value (`on:on`, `on:off`, ...) to the value of an
/// environment variable for the client. `off:off` disables the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Variable to set; `NODE_ENV` when absent.
    pub env: Option<String>,
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

impl ClientConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

/// Restart throttle and failure attribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSection {
    pub restart: RestartPolicy,
    pub failure_attribution: FailureAttribution,
}

impl From<SupervisorSection> for SupervisorConfig {
    fn from(section: SupervisorSection) -> Self {
        Self {
            restart: section.restart,
            attribution: section.failure_attribution,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownConfig {
    /// Bound on the drain phase, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("process {key} has neither a command nor an ipc channel")]
    NothingToStart { key: String },

    #[error("unknown log level {0:?}")]
    LogLevel(String),

    #[error("{name} must be greater than zero")]
    ZeroTimeout { name: &'static str },
}

impl ServiceConfig {
    /// Parse a configuration document and expand `%NAME%` references.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(text)?;
        config.expand_environment(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Read a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Check the configuration before anything is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((key, _)) = self
            .processes
            .iter()
            .find(|(_, process)| !process.is_startable())
        {
            return Err(ConfigError::NothingToStart { key: key.clone() });
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::LogLevel(self.logging.level.clone()));
        }
        if self.ipc.auth_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                name: "ipc.authTimeoutSecs",
            });
        }
        if self.client.status_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                name: "client.statusTimeoutSecs",
            });
        }
        Ok(())
    }

    /// Apply `GPII_LOG_LEVEL` and `GPII_AUTH_TIMEOUT_SECS`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(LOG_LEVEL_ENV_VAR) {
            self.logging.level = level;
        }
        if let Some(secs) = lookup(AUTH_TIMEOUT_ENV_VAR) {
            match secs.parse() {
                Ok(secs) => self.ipc.auth_timeout_secs = secs,
                Err(_) => warn!(value = %secs, "{AUTH_TIMEOUT_ENV_VAR} is not a number, ignoring"),
            }
        }
    }

    /// Expand `%NAME%` in every process command, environment value and
    /// working directory, and in the client's file paths. Unknown names are
    /// left as they are.
    pub fn expand_environment<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let expand_path = |path: &mut PathBuf| {
            *path = PathBuf::from(expand_environment_strings(&path.to_string_lossy(), &lookup));
        };
        if let Some(path) = self.client.secret_file.as_mut() {
            expand_path(path);
        }
        self.client.site_config_file.iter_mut().for_each(&expand_path);

        for process in self.processes.values_mut() {
            if let Some(command) = process.command.as_mut() {
                *command = expand_environment_strings(command, &lookup);
            }
            for value in process.env.values_mut() {
                *value = expand_environment_strings(value, &lookup);
            }
            if let Some(dir) = process.current_dir.as_mut() {
                expand_path(dir);
            }
        }
    }
}

/// Replace each `%NAME%` with its value.
pub fn expand_environment_strings<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => {
                let name = &after[..end];
                match (!name.is_empty()).then(|| lookup(name)).flatten() {
                    Some(value) => {
                        output.push_str(&value);
                        rest = &after[end + 1..];
                    }
                    None => {
                        // Keep the first '%' and rescan from the second one.
                        output.push('%');
                        output.push_str(name);
                        rest = &after[end..];
                    }
                }
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// Load configuration from `GPII_SERVICE_CONFIG` (or defaults) and the
/// environment overrides.
pub fn load_config() -> Result<ServiceConfig, ConfigError> {
    let mut config = match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) => {
            let path = PathBuf::from(path);
            info!(path = %path.display(), "Loading config file");
            ServiceConfig::from_file(&path)?
        }
        None => {
            info!("{CONFIG_ENV_VAR} not set, using the default configuration");
            ServiceConfig::default()
        }
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ipc.auth_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.channel, "gpii");
        assert_eq!(config.client.status_timeout(), Duration::from_secs(120));
        assert_eq!(config.shutdown.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.restart, RestartPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parses_service_document() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "processes": {
                    "gpii": {
                        "command": "gpii-app.exe",
                        "ipc": "gpii",
                        "autoRestart": true
                    }
                },
                "logging": { "level": "debug" },
                "client": { "statusTimeoutSecs": 20 },
                "supervisor": {
                    "restart": { "max_failures": 3 },
                    "failureAttribution": "reject-all"
                }
            }"#,
        )
        .unwrap();

        let gpii = &config.processes["gpii"];
        assert_eq!(gpii.command.as_deref(), Some("gpii-app.exe"));
        assert!(gpii.auto_restart);
        assert_eq!(config.client.status_timeout_secs, 20);
        assert_eq!(config.client.channel, "gpii");
        assert_eq!(config.supervisor.restart.max_failures, 3);
        assert_eq!(
            config.supervisor.restart.reset_after,
            RestartPolicy::default().reset_after
        );
        assert_eq!(
            SupervisorConfig::from(config.supervisor).attribution,
            FailureAttribution::RejectAll
        );
    }

    #[test]
    fn test_parses_client_files_and_metrics() {
        let config = ServiceConfig::from_json(
            r#"{
                "client": {
                    "secretFile": "C:\\secrets.json",
                    "siteConfigFile": "C:\\site.json",
                    "gpiiConfig": { "env": "GPII_ENV", "on:on": "metrics", "on:off": "plain" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.client.secret_file, Some(PathBuf::from("C:\\secrets.json")));
        assert_eq!(config.client.site_config_file, vec![PathBuf::from("C:\\site.json")]);
        let metrics = config.client.gpii_config.unwrap();
        assert_eq!(metrics.env.as_deref(), Some("GPII_ENV"));
        assert_eq!(metrics.values["on:on"], "metrics");
        assert_eq!(metrics.values.len(), 2);

        let config: ServiceConfig =
            serde_json::from_str(r#"{ "client": { "siteConfigFile": ["a.json", "b.json"] } }"#)
                .unwrap();
        assert_eq!(config.client.site_config_file.len(), 2);
    }

    #[test]
    fn test_validation() {
        let mut config = ServiceConfig::default();
        config
            .processes
            .insert("empty".into(), ProcessConfig::new("empty"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NothingToStart { key }) if key == "empty"
        ));

        let mut config = ServiceConfig::default();
        config.logging.level = "loud".into();
        assert!(matches!(config.validate(), Err(ConfigError::LogLevel(_))));

        let mut config = ServiceConfig::default();
        config.client.status_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout { .. })
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = ServiceConfig::default();
        config.apply_overrides(env(&[
            ("GPII_LOG_LEVEL", "debug"),
            ("GPII_AUTH_TIMEOUT_SECS", "5"),
        ]));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.ipc.auth_timeout_secs, 5);

        config.apply_overrides(env(&[("GPII_AUTH_TIMEOUT_SECS", "soon")]));
        assert_eq!(config.ipc.auth_timeout_secs, 5);
    }

    #[test]
    fn test_expand_environment_strings() {
        let lookup = env(&[("ProgramFiles", "C:\\Program Files"), ("USER", "bob")]);

        assert_eq!(
            expand_environment_strings("%ProgramFiles%\\GPII\\gpii.exe", &lookup),
            "C:\\Program Files\\GPII\\gpii.exe"
        );
        assert_eq!(expand_environment_strings("%USER%-%USER%", &lookup), "bob-bob");
        assert_eq!(expand_environment_strings("100%", &lookup), "100%");
        assert_eq!(expand_environment_strings("%MISSING%", &lookup), "%MISSING%");
        assert_eq!(expand_environment_strings("50% of %USER%", &lookup), "50% of bob");
        assert_eq!(expand_environment_strings("%%", &lookup), "%%");
    }

    #[test]
    fn test_expands_process_fields() {
        let mut config = ServiceConfig::default();
        let mut process = ProcessConfig::new("gpii").with_command("%APP%\\gpii.exe");
        process.env.insert("DATA".into(), "%APP%\\data".into());
        process.current_dir = Some(PathBuf::from("%APP%"));
        config.processes.insert("gpii".into(), process);
        config.client.secret_file = Some(PathBuf::from("%APP%\\secrets.json"));

        config.expand_environment(env(&[("APP", "C:\\gpii")]));

        let process = &config.processes["gpii"];
        assert_eq!(process.command.as_deref(), Some("C:\\gpii\\gpii.exe"));
        assert_eq!(process.env["DATA"], "C:\\gpii\\data");
        assert_eq!(process.current_dir, Some(PathBuf::from("C:\\gpii")));
        assert_eq!(
            config.client.secret_file,
            Some(PathBuf::from("C:\\gpii\\secrets.json"))
        );
    }
}
