//! Captain configuration

use anyhow::Result;
use armada_protocol::{ConfigPayload, UserPayload};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Captain configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptainConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token configuration
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Seeded worker fleet (in-memory directory)
    #[serde(default)]
    pub workers: Vec<WorkerSeed>,

    /// Seeded end users (in-memory directory)
    #[serde(default)]
    pub users: Vec<UserPayload>,
}

impl CaptainConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: CaptainConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for CaptainConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tokens: TokenConfig::default(),
            workers: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Shared API key workers present on the upgrade request
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:7700".parse().unwrap()
}

fn default_api_key() -> String {
    "insecure-dev-key".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: default_api_key(),
        }
    }
}

/// Token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Retention window in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_retention() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// A worker identity plus its routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSeed {
    pub worker_id: String,
    pub config: ConfigPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: CaptainConfig = toml::from_str("").unwrap();
        assert_eq!(config.tokens.retention_secs, 60);
        assert_eq!(config.server.bind.port(), 7700);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_seeded_fleet() {
        let config: CaptainConfig = toml::from_str(
            r#"
[server]
bind = "127.0.0.1:7710"
api_key = "s3cret"

[[workers]]
worker_id = "worker-1"

[workers.config]
worker_name = "worker-1"
region = "eu-west"
pool_id = 2
pool_tag = "residential"
pool_port = 8080
pool_subdomain = "res"
upstreams = []

[[users]]
id = 1
username = "alice"
password = "pw"
status = "active"
ip_whitelist = []
pools = ["residential:1000:0"]
"#,
        )
        .unwrap();

        assert_eq!(config.server.api_key, "s3cret");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].config.pool_id, 2);
        assert_eq!(config.users[0].username, "alice");
    }
}
