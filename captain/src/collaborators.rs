//! Collaborator seams
//!
//! Persistence and analytics live outside this service. The captain
//! talks to them through these traits; the in-memory implementations
//! back stand-alone deployments and the test suite.

use armada_protocol::{ConfigPayload, HealthReport, UsageRecord, UserPayload};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Worker identity as known to the persistence layer
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub pool_id: i64,
}

/// Read side of the persistence collaborator
#[async_trait]
pub trait Directory: Send + Sync {
    /// Credential check for a worker login attempt
    async fn authenticate_worker(&self, worker_id: &str) -> Option<WorkerProfile>;

    /// Current routing configuration for a worker
    async fn worker_config(&self, worker_id: &str) -> Option<ConfigPayload>;

    /// Look up an end user for a verification round-trip
    async fn find_user(&self, username: &str) -> Option<UserPayload>;
}

/// Ingestion side of the analytics collaborator
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn ingest_usage(&self, worker_id: &str, record: UsageRecord);
    async fn ingest_health(&self, worker_id: &str, report: HealthReport);
}

/// In-memory directory seeded from the captain configuration file
#[derive(Default)]
pub struct MemoryDirectory {
    workers: DashMap<String, ConfigPayload>,
    users: DashMap<String, UserPayload>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_worker(&self, worker_id: &str, config: ConfigPayload) {
        self.workers.insert(worker_id.to_string(), config);
    }

    pub fn insert_user(&self, user: UserPayload) {
        self.users.insert(user.username.clone(), user);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn authenticate_worker(&self, worker_id: &str) -> Option<WorkerProfile> {
        self.workers.get(worker_id).map(|config| WorkerProfile {
            pool_id: config.pool_id,
        })
    }

    async fn worker_config(&self, worker_id: &str) -> Option<ConfigPayload> {
        self.workers.get(worker_id).map(|config| config.clone())
    }

    async fn find_user(&self, username: &str) -> Option<UserPayload> {
        self.users.get(username).map(|user| user.clone())
    }
}

/// Analytics sink that counts reports and logs them
#[derive(Default)]
pub struct MemoryAnalytics {
    usage_reports: AtomicU64,
    health_reports: AtomicU64,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage_reports(&self) -> u64 {
        self.usage_reports.load(Ordering::Relaxed)
    }

    pub fn health_reports(&self) -> u64 {
        self.health_reports.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalytics {
    async fn ingest_usage(&self, worker_id: &str, record: UsageRecord) {
        self.usage_reports.fetch_add(1, Ordering::Relaxed);
        info!(
            "Usage from {}: user {} moved {} bytes through {}",
            worker_id,
            record.username,
            record.bytes_sent + record.bytes_received,
            record.destination_host,
        );
    }

    async fn ingest_health(&self, worker_id: &str, report: HealthReport) {
        self.health_reports.fetch_add(1, Ordering::Relaxed);
        info!(
            "Health from {}: status {:?}, {} upstreams, error rate {:.2}%",
            worker_id,
            report.status,
            report.upstreams.len(),
            report.error_rate,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_protocol::UserStatus;

    fn sample_config() -> ConfigPayload {
        ConfigPayload {
            worker_name: "worker-1".to_string(),
            region: "us-east".to_string(),
            pool_id: 4,
            pool_tag: "residential".to_string(),
            pool_port: 8080,
            pool_subdomain: "res".to_string(),
            upstreams: vec![],
        }
    }

    #[tokio::test]
    async fn test_worker_lookup() {
        let directory = MemoryDirectory::new();
        directory.insert_worker("worker-1", sample_config());

        let profile = directory.authenticate_worker("worker-1").await.unwrap();
        assert_eq!(profile.pool_id, 4);
        assert!(directory.authenticate_worker("worker-2").await.is_none());
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let directory = MemoryDirectory::new();
        directory.insert_user(UserPayload {
            id: 1,
            username: "alice".to_string(),
            password: "pw".to_string(),
            status: UserStatus::Active,
            ip_whitelist: vec![],
            pools: vec!["res:100:0".to_string()],
        });

        assert!(directory.find_user("alice").await.is_some());
        assert!(directory.find_user("bob").await.is_none());
    }
}
