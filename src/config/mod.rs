//! Configuration for the linkmux proxy.
//!
//! A single TOML file covers all subsystems; every section has working
//! defaults so an empty file (or none at all) yields a usable local
//! setup.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LinkmuxError, LinkmuxResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy front-end configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Admin API configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Metrics exposition configuration.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Reachability probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the SOCKS5 proxy listens on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:1080".parse().unwrap()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Port of the admin API, bound on loopback.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    7764
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port of the Prometheus exposition endpoint, bound on loopback.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// `host:port` dialed by High-confidence reachability probes. No data
    /// is exchanged over the connection.
    #[serde(default = "default_probe_target")]
    pub target: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: default_probe_target(),
        }
    }
}

fn default_probe_target() -> String {
    "google.com:80".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> LinkmuxResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is
    /// missing.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> LinkmuxResult<Self> {
        if path.as_ref().exists() {
            Self::from_file(path).await
        } else {
            info!(
                "Configuration file {:?} not found, using defaults",
                path.as_ref()
            );
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> LinkmuxResult<()> {
        if !self.probe.target.contains(':') {
            return Err(LinkmuxError::config(format!(
                "probe target {:?} must be in host:port form",
                self.probe.target
            )));
        }
        if self.api.port == self.monitoring.metrics_port {
            return Err(LinkmuxError::config(
                "api.port and monitoring.metrics_port must differ",
            ));
        }
        Ok(())
    }
}
