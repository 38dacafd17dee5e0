//! Layered configuration.
//!
//! Sources, highest priority first:
//! 1. The `data_dir` handed over by the host at `initialize`
//! 2. Environment variables (`HELPDESK_*`, `__` separates sections)
//! 3. `<data_dir>/helpdesk.toml`
//! 4. Built-in defaults
//!
//! `HELPDESK_WEBHOOKS__TIMEOUT_SECS=5` maps to `webhooks.timeout_secs`.

use crate::error::ConfigError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "helpdesk.toml";

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_excerpt_bytes() -> usize {
    2048
}

fn default_user_agent() -> String {
    "Helpdesk-Webhook/1.0".into()
}

fn default_bind() -> String {
    "127.0.0.1:0".into()
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookSettings {
    /// Upper bound on one delivery attempt, connect through body read.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Longest response body excerpt kept on a log entry.
    #[serde(default = "default_excerpt_bytes")]
    pub response_excerpt_bytes: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl WebhookSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            response_excerpt_bytes: default_excerpt_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub webhooks: WebhookSettings,
    #[serde(default)]
    pub http: HttpSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            webhooks: WebhookSettings::default(),
            http: HttpSettings::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration rooted at `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(data_dir).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn figment(data_dir: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let file = data_dir.join(CONFIG_FILE);
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }

        figment
            .merge(Env::prefixed("HELPDESK_").split("__"))
            .merge(Serialized::default("data_dir", data_dir))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.webhooks.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "webhooks.timeout_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.http.enabled && self.http.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "http.bind".into(),
                reason: format!("not a socket address: {}", self.http.bind),
            });
        }
        Ok(())
    }
}
