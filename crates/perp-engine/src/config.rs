//! Engine configuration.
//!
//! Loaded from a TOML file with environment-variable overrides
//! (`PERP_*`), so a container deployment can run without a config file
//! at all.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Deployment tag carried in logs (e.g. "production").
    #[serde(default = "default_environment")]
    pub environment: String,

    /// trace | debug | info | warn | error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file; stdout when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Postgres connection string.
    #[serde(default)]
    pub database_url: String,

    /// Admin HTTP port (bound on localhost).
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Default exchange name (e.g. "BINANCE").
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Notifier platform: "telegram" or "none".
    #[serde(default = "default_notifier_platform")]
    pub notifier_platform: String,

    /// Bot token for the notifier platform.
    #[serde(default)]
    pub notifier_token: String,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    8090
}

fn default_exchange() -> String {
    "BINANCE".to_string()
}

fn default_notifier_platform() -> String {
    "telegram".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            environment: default_environment(),
            log_level: default_log_level(),
            log_file: None,
            database_url: String::new(),
            http_port: default_http_port(),
            exchange: default_exchange(),
            notifier_platform: default_notifier_platform(),
            notifier_token: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {path:?}"))
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.environment, "PERP_ENVIRONMENT");
        override_string(&mut self.log_level, "PERP_LOG_LEVEL");
        override_string(&mut self.database_url, "PERP_DATABASE_URL");
        override_string(&mut self.exchange, "PERP_EXCHANGE");
        override_string(&mut self.notifier_platform, "PERP_NOTIFIER_PLATFORM");
        override_string(&mut self.notifier_token, "PERP_NOTIFIER_TOKEN");

        if let Ok(v) = std::env::var("PERP_LOG_FILE") {
            if !v.is_empty() {
                self.log_file = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("PERP_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.http_port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            bail!("database_url is required (set PERP_DATABASE_URL or the config file)");
        }
        if self.notifier_platform == "telegram" && self.notifier_token.is_empty() {
            bail!("notifier_token is required for the telegram notifier");
        }
        Ok(())
    }
}

fn override_string(target: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}
