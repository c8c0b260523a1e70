//! Configuration module

mod definitions;

pub use definitions::{DefinitionsManager, UpstreamDefinition};

use crate::common::net::split_host_port;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SOCKS5 server and admin endpoint configuration
    pub server: ServerConfig,

    /// Upstream pool configuration
    pub proxies: ProxiesConfig,

    /// TLS policy applied to health-check probes
    pub tls: TlsConfig,

    /// Metrics exposition and periodic summary
    pub metrics: MetricsConfig,

    /// Path to the users file (JSON array of username/password/allowed)
    pub users_file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// SOCKS5 listen address
    pub listen: String,
    /// Admin HTTP listen address; empty disables the admin endpoint
    pub reload_listen: Option<String>,
    /// Token required by POST /reload-proxies
    pub reload_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
    pub check_interval_seconds: u64,
    pub check_timeout_seconds: u64,
    /// `host:port` expected to speak TLS 1.2+
    pub health_check_target: String,
    /// Path to the upstream definitions file
    pub config_file_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub skip_verify: bool,
    pub sni_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exposition listen address; empty disables it
    pub listen: Option<String>,
    /// Interval of the periodic metrics summary log line
    pub log_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:1080".to_string(),
            reload_listen: None,
            reload_token: None,
        }
    }
}

impl Default for ProxiesConfig {
    fn default() -> Self {
        ProxiesConfig {
            check_interval_seconds: 60,
            check_timeout_seconds: 10,
            health_check_target: "www.google.com:443".to_string(),
            config_file_path: "proxies.json".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            listen: None,
            log_interval_seconds: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            proxies: ProxiesConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
            users_file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, collecting every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();

        if self.server.listen.is_empty() {
            errs.push("server.listen must be set".to_string());
        } else if let Err(e) = split_host_port(&self.server.listen) {
            errs.push(format!("invalid server.listen: {}", e));
        }

        if self.proxies.check_timeout_seconds == 0 {
            errs.push("proxies.check_timeout_seconds must be positive".to_string());
        }

        if self.proxies.health_check_target.is_empty() {
            errs.push("proxies.health_check_target must be set".to_string());
        } else if let Err(e) = split_host_port(&self.proxies.health_check_target) {
            errs.push(format!("invalid proxies.health_check_target: {}", e));
        }

        if self.proxies.config_file_path.is_empty() {
            errs.push("proxies.config_file_path must be set".to_string());
        }

        if let Some(listen) = self.server.reload_listen.as_deref() {
            if !listen.is_empty() && split_host_port(listen).is_err() {
                errs.push(format!("invalid server.reload_listen '{}'", listen));
            }
        }

        if let Some(listen) = self.metrics.listen.as_deref() {
            if !listen.is_empty() && split_host_port(listen).is_err() {
                errs.push(format!("invalid metrics.listen '{}'", listen));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errs.join("; ")))
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.proxies.check_interval_seconds)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.proxies.check_timeout_seconds)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.log_interval_seconds)
    }
}
