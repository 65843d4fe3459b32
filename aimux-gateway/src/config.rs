//! Gateway configuration: TOML file loading, server knobs, validation.
//!
//! The engine-level sections (`providers`, `routing`, `model_map`, …) are
//! flattened from [`aimux_core::GatewayConfig`]; this module adds the HTTP
//! server and logging sections.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aimux_core::config::duration_serde;
use aimux_core::GatewayConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request deadline enforced by the dispatch loop
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            max_body_size: default_max_body_size(),
            cors: CorsConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_max_body_size() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: default_origins(),
        }
    }
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Full gateway configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.server.max_body_size == 0 {
            anyhow::bail!("server.max_body_size must be non-zero");
        }
        for (key, provider) in &self.gateway.providers {
            if key != &provider.name {
                anyhow::bail!(
                    "provider table key '{key}' does not match provider name '{}'",
                    provider.name
                );
            }
        }
        Ok(())
    }
}
