//! Worker runtime orchestration
//!
//! Owns the control channel, the upstream selector, the user cache and
//! the health aggregator, and exposes the capability surface the proxy
//! protocol handlers call into.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use armada_protocol::{ConfigPayload, Event, UsageRecord};

use crate::config::WorkerConfig;
use crate::control::{ControlChannel, ControlSender, EventHandler};
use crate::health::HealthAggregator;
use crate::upstreams::{Upstream, UpstreamSelector};
use crate::users::{UserCache, UserCacheConfig, UserCacheError};

#[derive(Debug, Clone)]
struct PoolBinding {
    pool_id: i64,
    pool_tag: String,
}

/// The worker-side runtime state
pub struct WorkerRuntime {
    config: WorkerConfig,
    control: Arc<ControlChannel>,
    sender: ControlSender,
    selector: UpstreamSelector,
    users: Arc<UserCache>,
    health: Arc<HealthAggregator>,
    pool: RwLock<Option<PoolBinding>>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let control = ControlChannel::new(
            config.captain.clone(),
            Duration::from_secs(config.control.retry_delay_secs),
        );
        let sender = control.sender();

        let users = UserCache::new(
            UserCacheConfig {
                ttl: Duration::from_secs(config.verification.cache_ttl_secs),
                verify_timeout: Duration::from_secs(config.verification.timeout_secs),
                connection_ceiling: config.verification.connection_ceiling,
            },
            Arc::new(sender.clone()),
        );

        Arc::new(Self {
            config,
            control,
            sender,
            selector: UpstreamSelector::new(),
            users,
            health: HealthAggregator::new(),
            pool: RwLock::new(None),
        })
    }

    /// Spawn the control loop and every background task
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.control
                .clone()
                .start(self.clone(), shutdown.clone()),
            self.users.clone().start_sweeper(
                Duration::from_secs(self.config.verification.sweep_interval_secs),
                shutdown.clone(),
            ),
            self.health.clone().start_sampler(
                Duration::from_secs(self.config.health.sample_interval_secs),
                shutdown.clone(),
            ),
            self.clone().start_telemetry(shutdown),
        ]
    }

    /// Periodic health telemetry push
    fn start_telemetry(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.health.telemetry_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately; skip it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.send_health_telemetry(),
                    _ = shutdown.changed() => {
                        debug!("Telemetry loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Apply a config push: routing state is replaced wholesale
    fn apply_config(&self, config: ConfigPayload) {
        info!(
            "Applying config for pool {} ({} upstreams)",
            config.pool_tag,
            config.upstreams.len()
        );

        self.selector
            .set_upstreams(config.upstreams.into_iter().map(Upstream::from).collect());
        self.health.set_labels(&config.worker_name, &config.region);
        *self.pool.write() = Some(PoolBinding {
            pool_id: config.pool_id,
            pool_tag: config.pool_tag,
        });
    }

    // ----- capability surface for the proxy protocol handlers -----

    /// Decide whether a credential may open a proxy session
    pub async fn verify_user(&self, username: &str, password: &str) -> bool {
        let pool_tag = self
            .pool
            .read()
            .as_ref()
            .map(|pool| pool.pool_tag.clone())
            .unwrap_or_default();

        self.users.verify(username, password, &pool_tag).await
    }

    /// Sticky upstream for a user session
    pub fn next_upstream(&self, username: &str, session_key: &str) -> Option<Upstream> {
        self.users
            .upstream_for_session(username, session_key, &self.selector)
    }

    pub fn has_upstreams(&self) -> bool {
        self.selector.has_upstreams()
    }

    /// Count a new proxy session; fails at the per-user ceiling
    pub fn add_connection(&self, username: &str) -> Result<(), UserCacheError> {
        self.users.add_connection(username)?;
        self.health.increment_connection();
        Ok(())
    }

    pub fn remove_connection(&self, username: &str) {
        self.users.remove_connection(username);
        self.health.decrement_connection();
    }

    pub fn add_throughput(&self, bytes: u64) {
        self.health.add_throughput(bytes);
    }

    pub fn record_success(&self) {
        self.health.record_success();
    }

    pub fn record_error(&self) {
        self.health.record_error();
    }

    pub fn record_upstream_latency(&self, upstream_id: i64, latency: Duration, is_error: bool) {
        self.health
            .record_upstream_latency(upstream_id, latency, is_error);
    }

    /// Best-effort usage report; dropped while disconnected
    pub fn send_data_usage(&self, record: UsageRecord) {
        if let Err(e) = self.sender.send(Event::TelemetryUsage(record)) {
            warn!("Dropping usage report: {}", e);
        }
    }

    /// Push one health snapshot; dropped while disconnected
    ///
    /// The snapshot is only built when the channel is up, so counters
    /// keep accumulating across an outage instead of being discarded.
    pub fn send_health_telemetry(&self) {
        if !self.sender.is_connected() {
            warn!("Control channel down; dropping health telemetry");
            return;
        }

        let report = self.health.build_snapshot();
        if let Err(e) = self.sender.send(Event::TelemetryHealth(report)) {
            warn!("Dropping health telemetry: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler for WorkerRuntime {
    async fn handle_event(&self, event: Event) {
        match event {
            Event::Config(config) => self.apply_config(config),
            Event::LoginSuccess(user) => {
                if let Err(e) = self.users.complete_verification(&user) {
                    warn!("Dropping malformed login_success: {}", e);
                }
            }
            Event::UserChange(change) => {
                info!("User {} changed upstream of us", change.username);
                self.users.invalidate(&change.username);
            }
            Event::PoolChange(change) => {
                let ours = self.pool.read().as_ref().map(|pool| pool.pool_id)
                    == Some(change.pool_id);
                if ours {
                    info!("Pool {} changed; flushing user cache", change.pool_id);
                    self.users.clear();
                }
            }
            Event::Error(notice) => {
                warn!("Captain reported an error: {}", notice.payload);
            }
            other => warn!("Dropping unexpected {} event", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_protocol::{PoolChange, UpstreamEntry, UserPayload, UserStatus};

    fn entry(id: i64, host: &str) -> UpstreamEntry {
        UpstreamEntry {
            upstream_id: id,
            upstream_tag: format!("up-{}", id),
            upstream_format: "socks5".to_string(),
            upstream_username: "u".to_string(),
            upstream_password: "p".to_string(),
            upstream_host: host.to_string(),
            upstream_port: 1080,
            upstream_provider: "acme".to_string(),
            weight: 1.0,
        }
    }

    fn config_event(pool_id: i64, upstreams: Vec<UpstreamEntry>) -> Event {
        Event::Config(ConfigPayload {
            worker_name: "worker-1".to_string(),
            region: "eu-west".to_string(),
            pool_id,
            pool_tag: "residential".to_string(),
            pool_port: 8080,
            pool_subdomain: "res".to_string(),
            upstreams,
        })
    }

    fn user_event(username: &str) -> Event {
        Event::LoginSuccess(UserPayload {
            id: 1,
            username: username.to_string(),
            password: "pw".to_string(),
            status: UserStatus::Active,
            ip_whitelist: vec![],
            pools: vec!["residential:1000:0".to_string()],
        })
    }

    #[tokio::test]
    async fn test_config_replaces_routing_state() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        assert!(!runtime.has_upstreams());

        runtime
            .handle_event(config_event(2, vec![entry(1, "a"), entry(2, "b")]))
            .await;

        assert!(runtime.has_upstreams());
        // no cached user: plain round robin
        let hosts: Vec<String> = (0..3)
            .map(|_| runtime.next_upstream("ghost", "s1").unwrap().host)
            .collect();
        assert_eq!(hosts, vec!["a", "b", "a"]);

        runtime.handle_event(config_event(2, vec![])).await;
        assert!(!runtime.has_upstreams());
        assert!(runtime.next_upstream("ghost", "s1").is_none());
    }

    #[tokio::test]
    async fn test_session_affinity_for_cached_user() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        runtime
            .handle_event(config_event(2, vec![entry(1, "a"), entry(2, "b")]))
            .await;
        runtime.handle_event(user_event("alice")).await;

        let first = runtime.next_upstream("alice", "s1").unwrap();
        let again = runtime.next_upstream("alice", "s1").unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_pool_change_flushes_our_pool_only() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        runtime.handle_event(config_event(2, vec![entry(1, "a")])).await;
        runtime.handle_event(user_event("alice")).await;

        runtime
            .handle_event(Event::PoolChange(PoolChange { pool_id: 9 }))
            .await;
        assert!(runtime.users.contains("alice"));

        runtime
            .handle_event(Event::PoolChange(PoolChange { pool_id: 2 }))
            .await;
        assert!(!runtime.users.contains("alice"));
    }

    #[tokio::test]
    async fn test_verify_fails_closed_while_disconnected() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        // the control channel was never started, so the send fails and
        // verification denies immediately
        assert!(!runtime.verify_user("alice", "pw").await);
    }

    #[tokio::test]
    async fn test_cached_verify_without_channel() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        runtime.handle_event(user_event("alice")).await;

        assert!(runtime.verify_user("alice", "pw").await);
        assert!(!runtime.verify_user("alice", "wrong").await);
    }

    #[tokio::test]
    async fn test_telemetry_dropped_without_reset_while_disconnected() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        runtime.handle_event(user_event("alice")).await;
        runtime.add_connection("alice").unwrap();
        runtime.add_throughput(1024);

        // dropped, but the counters survive for the next push
        runtime.send_health_telemetry();

        let report = runtime.health.build_snapshot();
        assert_eq!(report.total_connections, 1);
        assert_eq!(report.bytes_proxied, 1024);
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let runtime = WorkerRuntime::new(WorkerConfig::default());
        runtime.handle_event(user_event("alice")).await;

        runtime.add_connection("alice").unwrap();
        runtime.add_connection("alice").unwrap();
        runtime.remove_connection("alice");

        let report = runtime.health.build_snapshot();
        assert_eq!(report.active_connections, 1);
        assert_eq!(report.total_connections, 2);
    }
}
