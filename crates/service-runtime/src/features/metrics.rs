//! # Metrics Switch
//!
//! The site configuration can carry a `metricsSwitch` (`on:on`, `on:off`,
//! `off:off`, ...). Before each start of the companion client the switch
//! is read again: `off:off` cancels the start, any other value sets the
//! configured environment variable to what `gpiiConfig` maps it to.

use crate::container::MetricsConfig;
use serde_json::Value;
use std::path::PathBuf;
use sv_03_process_supervisor::{ProcessConfig, StartHook};
use tracing::{debug, info, warn};

/// Variable set when `gpiiConfig.env` is absent.
pub const DEFAULT_METRICS_ENV: &str = "NODE_ENV";

/// Switch value that disables the client.
pub const METRICS_OFF: &str = "off:off";

/// Applies the metrics switch to the processes behind one channel.
#[derive(Debug, Clone)]
pub struct MetricsSwitch {
    channel: String,
    site_config_files: Vec<PathBuf>,
    config: Option<MetricsConfig>,
}

impl MetricsSwitch {
    pub fn new(
        channel: impl Into<String>,
        site_config_files: Vec<PathBuf>,
        config: Option<MetricsConfig>,
    ) -> Self {
        Self {
            channel: channel.into(),
            site_config_files,
            config,
        }
    }

    /// The current switch value, lowercased, from the first site
    /// configuration file that loads.
    pub fn value(&self) -> Option<String> {
        let site_config = self.site_config_files.iter().find_map(|path| {
            let text = std::fs::read_to_string(path)
                .map_err(|e| warn!(path = %path.display(), error = %e, "Unable to read site config"))
                .ok()?;
            serde_json::from_str::<Value>(&text)
                .map_err(|e| warn!(path = %path.display(), error = %e, "Unable to parse site config"))
                .ok()
        })?;
        site_config
            .get("metricsSwitch")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
    }
}

impl StartHook for MetricsSwitch {
    fn starting(&self, config: &mut ProcessConfig) {
        if config.ipc.as_deref() != Some(self.channel.as_str()) {
            return;
        }
        let Some(metrics) = &self.config else {
            return;
        };
        let Some(value) = self.value() else {
            return;
        };

        if value == METRICS_OFF {
            info!(key = %config.key, "Client disabled via metrics switch");
            config.disabled = true;
        } else if let Some(setting) = metrics.values.get(&value) {
            let name = metrics.env.as_deref().unwrap_or(DEFAULT_METRICS_ENV);
            debug!(key = %config.key, switch = %value, env = name, "Applying metrics switch");
            config.env.insert(name.to_string(), setting.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn metrics_config(env: Option<&str>) -> MetricsConfig {
        MetricsConfig {
            env: env.map(str::to_string),
            values: BTreeMap::from([
                ("on:on".to_string(), "app.metrics".to_string()),
                ("on:off".to_string(), "app.plain".to_string()),
            ]),
        }
    }

    fn site_config(dir: &TempDir, switch: &str) -> PathBuf {
        let path = dir.path().join("site.json");
        std::fs::write(&path, format!(r#"{{ "metricsSwitch": "{switch}" }}"#)).unwrap();
        path
    }

    fn client_process() -> ProcessConfig {
        ProcessConfig::new("gpii")
            .with_command("gpii-app.exe")
            .with_ipc("gpii")
    }

    #[test]
    fn test_switch_sets_environment() {
        let dir = tempfile::tempdir().unwrap();
        let switch = MetricsSwitch::new(
            "gpii",
            vec![dir.path().join("missing.json"), site_config(&dir, "ON:on")],
            Some(metrics_config(None)),
        );
        assert_eq!(switch.value().as_deref(), Some("on:on"));

        let mut config = client_process();
        switch.starting(&mut config);
        assert_eq!(config.env["NODE_ENV"], "app.metrics");
        assert!(!config.disabled);

        let switch = MetricsSwitch::new(
            "gpii",
            vec![site_config(&dir, "on:off")],
            Some(metrics_config(Some("GPII_ENV"))),
        );
        let mut config = client_process();
        switch.starting(&mut config);
        assert_eq!(config.env["GPII_ENV"], "app.plain");
    }

    #[test]
    fn test_off_off_disables_client() {
        let dir = tempfile::tempdir().unwrap();
        let switch = MetricsSwitch::new(
            "gpii",
            vec![site_config(&dir, "off:off")],
            Some(metrics_config(None)),
        );

        let mut config = client_process();
        switch.starting(&mut config);
        assert!(config.disabled);
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_other_processes_and_missing_config_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = site_config(&dir, "off:off");

        let switch = MetricsSwitch::new("gpii", vec![path.clone()], Some(metrics_config(None)));
        let mut other = ProcessConfig::new("tool").with_command("tool.exe");
        switch.starting(&mut other);
        assert!(!other.disabled);

        let switch = MetricsSwitch::new("gpii", vec![path], None);
        let mut config = client_process();
        switch.starting(&mut config);
        assert!(!config.disabled);

        let switch = MetricsSwitch::new("gpii", Vec::new(), Some(metrics_config(None)));
        let mut config = client_process();
        switch.starting(&mut config);
        assert_eq!(config, client_process());
    }
}
