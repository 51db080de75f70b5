//! YAML configuration for the obexd daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Listener group tuning
    #[serde(default)]
    pub group: GroupConfig,

    /// Remote endpoint identities allowed to win a connection round.
    /// Empty means any identified peer may win.
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the human format
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Tuning for the listener group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// How long a rejection responder keeps the losing socket open for the
    /// peer to read the status before forcing the close
    #[serde(default = "default_reject_timeout", with = "humantime_serde")]
    pub reject_timeout: Duration,

    /// Status byte sent to losing connections
    #[serde(default = "default_reject_code")]
    pub reject_code: u8,

    /// Socket allocation attempts before giving up
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,

    /// Pause between allocation attempts while the radio is turning on
    #[serde(default = "default_create_backoff", with = "humantime_serde")]
    pub create_backoff: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            reject_timeout: default_reject_timeout(),
            reject_code: default_reject_code(),
            create_retries: default_create_retries(),
            create_backoff: default_create_backoff(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reject_timeout() -> Duration {
    Duration::from_secs(5)
}

/// OBEX "service unavailable" with the final bit set.
fn default_reject_code() -> u8 {
    0xD3
}

fn default_create_retries() -> u32 {
    10
}

fn default_create_backoff() -> Duration {
    Duration::from_millis(300)
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.group.create_retries == 0 {
            anyhow::bail!("group.create_retries must be at least 1");
        }

        if self.group.reject_timeout.is_zero() {
            anyhow::bail!("group.reject_timeout must be non-zero");
        }

        Ok(())
    }
}
