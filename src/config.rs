use crate::interceptor::{RewriteSettings, DEFAULT_MARKER_PREFIX};
use crate::sanitize::DEFAULT_PLACEHOLDER;
use crate::subject::DEFAULT_DATE_FORMAT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `unix:/path`, a bare path, or `inet:host:port`
    pub socket_path: String,
    pub mapping_path: String,
    pub marker_prefix: String,
    /// chrono format of the date a subject may start with
    pub date_format: String,
    pub placeholder: char,
    pub watch: bool,
    pub watch_poll_interval_secs: u64,
    pub pid_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/attach-rename-milter.sock".to_string(),
            mapping_path: "/etc/attach-rename-milter/mappings.yaml".to_string(),
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            placeholder: DEFAULT_PLACEHOLDER,
            watch: true,
            watch_poll_interval_secs: 2,
            pid_file: "/var/run/attach-rename-milter.pid".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.marker_prefix.is_empty() {
            anyhow::bail!("marker_prefix must not be empty");
        }
        if self.date_format.is_empty() {
            anyhow::bail!("date_format must not be empty");
        }
        if crate::sanitize::sanitize_filename(&self.placeholder.to_string(), '_')
            != self.placeholder.to_string()
        {
            anyhow::bail!("placeholder '{}' is not allowed in filenames", self.placeholder.escape_default());
        }
        Ok(())
    }

    pub fn rewrite_settings(&self) -> RewriteSettings {
        RewriteSettings {
            marker_prefix: self.marker_prefix.clone(),
            date_format: self.date_format.clone(),
            placeholder: self.placeholder,
        }
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch_poll_interval_secs.max(1))
    }
}
