//! Telemetry payloads: usage records and health snapshots

use serde::{Deserialize, Serialize};

/// Per-connection usage report
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub username: String,
    pub pool_tag: String,
    pub worker_name: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub client_ip: String,
    pub protocol: String,
    pub destination_host: String,
    pub destination_port: u16,
    pub status_code: u16,
}

/// Coarse health classification
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Idle,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time worker health snapshot
///
/// Built by draining the worker's counters; each report covers exactly
/// the interval since the previous one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub worker_name: String,
    pub region: String,
    pub status: HealthStatus,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_proxied: u64,
    pub error_rate: f64,
    pub upstreams: Vec<UpstreamHealth>,
    pub timestamp: u64,
}

/// Per-upstream slice of a health snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpstreamHealth {
    pub upstream_id: i64,
    pub average_latency_ms: f64,
    pub requests: u64,
    pub error_rate: f64,
    pub status: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            r#""degraded""#
        );
        assert_eq!(
            serde_json::from_str::<HealthStatus>(r#""idle""#).unwrap(),
            HealthStatus::Idle
        );
    }

    #[test]
    fn test_report_roundtrip() {
        let report = HealthReport {
            worker_name: "worker-1".to_string(),
            region: "us-east".to_string(),
            status: HealthStatus::Healthy,
            cpu_usage: 12.5,
            memory_usage: 40.0,
            active_connections: 3,
            total_connections: 120,
            bytes_proxied: 4096,
            error_rate: 0.0,
            upstreams: vec![UpstreamHealth {
                upstream_id: 11,
                average_latency_ms: 80.0,
                requests: 40,
                error_rate: 2.5,
                status: HealthStatus::Healthy,
            }],
            timestamp: 1_700_000_000,
        };

        let raw = serde_json::to_string(&report).unwrap();
        let decoded: HealthReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, report);
    }
}
