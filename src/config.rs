use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};

use crate::prelude::*;

/// Process configuration, loaded once at startup and immutable afterwards.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,

    pub device: DeviceConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let absolute_path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        info!(path = %absolute_path.display(), "loading the configuration…");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read the config file `{}`", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse the config file `{}`", path.display()))?;
        ensure!(
            !config.device.gateway_address.is_empty(),
            "required parameter `device.gateway-address` must not be empty",
        );
        ensure!(
            !config.device.login_password.is_empty(),
            "required parameter `device.login-password` must not be empty",
        );
        ensure!(
            config.web.metrics_path.starts_with('/'),
            "`web.metrics-path` must start with `/`",
        );
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct WebConfig {
    #[serde(default = "WebConfig::default_listen_address")]
    pub listen_address: String,

    #[serde(default = "WebConfig::default_metrics_path")]
    pub metrics_path: String,
}

impl WebConfig {
    fn default_listen_address() -> String {
        "0.0.0.0:9871".to_string()
    }

    fn default_metrics_path() -> String {
        "/metrics".to_string()
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            metrics_path: Self::default_metrics_path(),
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DeviceConfig {
    pub gateway_address: String,

    #[serde(default = "DeviceConfig::default_login_email")]
    pub login_email: String,

    pub login_password: String,

    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    /// Pause between the device client's retries of a failed call.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "DeviceConfig::default_retry_interval")]
    pub retry_interval: humantime::Duration,

    /// Total retry budget per call. Zero disables retries.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "DeviceConfig::default_retry_timeout")]
    pub retry_timeout: humantime::Duration,
}

impl DeviceConfig {
    fn default_login_email() -> String {
        "powerwall_exporter@example.org".to_string()
    }

    fn default_retry_interval() -> humantime::Duration {
        std::time::Duration::from_secs(1).into()
    }

    fn default_retry_timeout() -> humantime::Duration {
        std::time::Duration::ZERO.into()
    }
}
