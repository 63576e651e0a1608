//! Worker configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Captain endpoint
    #[serde(default)]
    pub captain: CaptainEndpoint,

    /// Control-channel tuning
    #[serde(default)]
    pub control: ControlConfig,

    /// User verification and caching
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Health sampling and telemetry
    #[serde(default)]
    pub health: HealthConfig,
}

impl WorkerConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: WorkerConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            captain: CaptainEndpoint::default(),
            control: ControlConfig::default(),
            verification: VerificationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Where and how to reach captain
#[derive(Debug, Clone, Deserialize)]
pub struct CaptainEndpoint {
    /// Base URL of the captain service
    #[serde(default = "default_captain_url")]
    pub url: String,

    /// Shared API key presented on the upgrade request
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// This worker's identity
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

fn default_captain_url() -> String {
    "http://127.0.0.1:7700".to_string()
}

fn default_api_key() -> String {
    "insecure-dev-key".to_string()
}

fn default_worker_id() -> String {
    "worker-1".to_string()
}

impl Default for CaptainEndpoint {
    fn default() -> Self {
        Self {
            url: default_captain_url(),
            api_key: default_api_key(),
            worker_id: default_worker_id(),
        }
    }
}

/// Control-channel tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Delay between reconnect attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_retry_delay() -> u64 {
    3
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// User verification and caching
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    /// Round-trip timeout in seconds
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,

    /// Cached-user lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Eviction sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-user concurrent connection ceiling
    #[serde(default = "default_connection_ceiling")]
    pub connection_ceiling: u32,
}

fn default_verify_timeout() -> u64 {
    5
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_connection_ceiling() -> u32 {
    50
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_verify_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            connection_ceiling: default_connection_ceiling(),
        }
    }
}

/// Health sampling and telemetry
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// System sampling interval in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Health telemetry push interval in seconds
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
}

fn default_sample_interval() -> u64 {
    60
}

fn default_telemetry_interval() -> u64 {
    3600
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            telemetry_interval_secs: default_telemetry_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config.control.retry_delay_secs, 3);
        assert_eq!(config.verification.timeout_secs, 5);
        assert_eq!(config.verification.connection_ceiling, 50);
        assert_eq!(config.health.telemetry_interval_secs, 3600);
    }

    #[test]
    fn test_partial_override() {
        let config: WorkerConfig = toml::from_str(
            r#"
[captain]
url = "https://captain.example.com"
worker_id = "edge-7"

[verification]
timeout_secs = 2
"#,
        )
        .unwrap();

        assert_eq!(config.captain.url, "https://captain.example.com");
        assert_eq!(config.captain.worker_id, "edge-7");
        assert_eq!(config.verification.timeout_secs, 2);
        // untouched sections keep their defaults
        assert_eq!(config.verification.cache_ttl_secs, 300);
    }
}
