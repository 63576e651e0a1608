//! Concurrent health-metrics aggregation
//!
//! Counters take lock-free increments from every proxy task; a
//! periodic sampler appends process CPU/memory readings. Building a
//! snapshot drains the samples and swaps every counter back to zero,
//! so each report covers exactly the interval since the previous one.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use armada_protocol::{HealthReport, HealthStatus, UpstreamHealth};

use crate::sysinfo;

/// Point-in-time CPU/memory reading
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub timestamp: u64,
}

#[derive(Default)]
struct UpstreamCounters {
    total_latency_ms: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

#[derive(Default, Clone)]
struct Labels {
    worker_name: String,
    region: String,
}

/// Shared health aggregator
pub struct HealthAggregator {
    labels: RwLock<Labels>,
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    bytes_proxied: AtomicU64,
    errors: AtomicU64,
    successes: AtomicU64,
    upstreams: DashMap<i64, UpstreamCounters>,
    samples: Mutex<Vec<HealthSample>>,
}

impl HealthAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            labels: RwLock::new(Labels::default()),
            active_connections: AtomicI64::new(0),
            total_connections: AtomicU64::new(0),
            bytes_proxied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            upstreams: DashMap::new(),
            samples: Mutex::new(Vec::new()),
        })
    }

    /// Update the worker/region labels from a config push
    pub fn set_labels(&self, worker_name: &str, region: &str) {
        *self.labels.write() = Labels {
            worker_name: worker_name.to_string(),
            region: region.to_string(),
        };
    }

    pub fn increment_connection(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_throughput(&self, bytes: u64) {
        self.bytes_proxied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_latency(&self, upstream_id: i64, latency: Duration, is_error: bool) {
        let counters = self.upstreams.entry(upstream_id).or_default();
        counters
            .total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if is_error {
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append one CPU/memory sample
    pub fn record_sample(&self, cpu_usage: f64, memory_usage: f64) {
        self.samples.lock().push(HealthSample {
            cpu_usage,
            memory_usage,
            timestamp: unix_now(),
        });
    }

    /// Build a snapshot and reset every counter
    ///
    /// Two consecutive calls with no intervening activity yield a
    /// zeroed second report; nothing is ever counted twice.
    pub fn build_snapshot(&self) -> HealthReport {
        let samples = std::mem::take(&mut *self.samples.lock());

        let active = self.active_connections.swap(0, Ordering::Relaxed).max(0) as u64;
        let total = self.total_connections.swap(0, Ordering::Relaxed);
        let bytes = self.bytes_proxied.swap(0, Ordering::Relaxed);
        let errors = self.errors.swap(0, Ordering::Relaxed);
        let successes = self.successes.swap(0, Ordering::Relaxed);

        // Removing keys one at a time keeps concurrent increments: a
        // recorder racing with the drain lands in a fresh entry that
        // the next snapshot will pick up
        let keys: Vec<i64> = self.upstreams.iter().map(|entry| *entry.key()).collect();
        let mut upstreams = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((upstream_id, counters)) = self.upstreams.remove(&key) {
                upstreams.push(drain_upstream(upstream_id, &counters));
            }
        }

        let requests = errors + successes;
        let error_rate = if requests > 0 {
            errors as f64 / requests as f64 * 100.0
        } else {
            0.0
        };

        let status = if active == 0 && total == 0 {
            HealthStatus::Idle
        } else if error_rate > 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let (cpu_usage, memory_usage) = average_samples(&samples);
        let labels = self.labels.read().clone();

        HealthReport {
            worker_name: labels.worker_name,
            region: labels.region,
            status,
            cpu_usage,
            memory_usage,
            active_connections: active,
            total_connections: total,
            bytes_proxied: bytes,
            error_rate,
            upstreams,
            timestamp: unix_now(),
        }
    }

    /// Start the periodic CPU/memory sampler
    pub fn start_sampler(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let (cpu, memory) = sysinfo::sample_system().await;
                        self.record_sample(cpu, memory);
                    }
                    _ = shutdown.changed() => {
                        debug!("Health sampler shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn drain_upstream(upstream_id: i64, counters: &UpstreamCounters) -> UpstreamHealth {
    let requests = counters.requests.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    let total_latency = counters.total_latency_ms.load(Ordering::Relaxed);

    let average_latency_ms = if requests > 0 {
        total_latency as f64 / requests as f64
    } else {
        0.0
    };
    let error_rate = if requests > 0 {
        errors as f64 / requests as f64 * 100.0
    } else {
        0.0
    };

    let status = if error_rate > 80.0 {
        HealthStatus::Unhealthy
    } else if error_rate > 50.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    UpstreamHealth {
        upstream_id,
        average_latency_ms,
        requests,
        error_rate,
        status,
    }
}

fn average_samples(samples: &[HealthSample]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let count = samples.len() as f64;
    let cpu = samples.iter().map(|s| s.cpu_usage).sum::<f64>() / count;
    let memory = samples.iter().map(|s| s.memory_usage).sum::<f64>() / count;
    (cpu, memory)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_resets_counters() {
        let health = HealthAggregator::new();
        health.increment_connection();
        health.add_throughput(4096);
        health.record_success();
        health.record_error();
        health.record_upstream_latency(1, Duration::from_millis(100), false);
        health.record_sample(50.0, 25.0);

        let first = health.build_snapshot();
        assert_eq!(first.active_connections, 1);
        assert_eq!(first.total_connections, 1);
        assert_eq!(first.bytes_proxied, 4096);
        assert_eq!(first.upstreams.len(), 1);
        assert_eq!(first.cpu_usage, 50.0);

        let second = health.build_snapshot();
        assert_eq!(second.active_connections, 0);
        assert_eq!(second.total_connections, 0);
        assert_eq!(second.bytes_proxied, 0);
        assert_eq!(second.error_rate, 0.0);
        assert!(second.upstreams.is_empty());
        assert_eq!(second.status, HealthStatus::Idle);
    }

    #[test]
    fn test_error_rate() {
        let health = HealthAggregator::new();
        health.increment_connection();
        health.record_error();
        health.record_success();
        health.record_success();

        let report = health.build_snapshot();
        assert!((report.error_rate - 33.33).abs() < 0.01);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_idle_with_no_requests() {
        let health = HealthAggregator::new();
        let report = health.build_snapshot();

        assert_eq!(report.error_rate, 0.0);
        assert_eq!(report.status, HealthStatus::Idle);
    }

    #[test]
    fn test_degraded_status() {
        let health = HealthAggregator::new();
        health.increment_connection();
        for _ in 0..3 {
            health.record_error();
        }
        health.record_success();

        let report = health.build_snapshot();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_upstream_statuses() {
        let health = HealthAggregator::new();

        // 9 errors in 10 requests: unhealthy
        for i in 0..10 {
            health.record_upstream_latency(1, Duration::from_millis(100), i < 9);
        }
        // 6 errors in 10 requests: degraded
        for i in 0..10 {
            health.record_upstream_latency(2, Duration::from_millis(50), i < 6);
        }
        // clean: healthy
        health.record_upstream_latency(3, Duration::from_millis(100), false);
        health.record_upstream_latency(3, Duration::from_millis(200), false);

        let mut upstreams = health.build_snapshot().upstreams;
        upstreams.sort_by_key(|u| u.upstream_id);

        assert_eq!(upstreams[0].status, HealthStatus::Unhealthy);
        assert_eq!(upstreams[1].status, HealthStatus::Degraded);
        assert_eq!(upstreams[2].status, HealthStatus::Healthy);
        assert_eq!(upstreams[2].average_latency_ms, 150.0);
        assert_eq!(upstreams[2].requests, 2);
    }

    #[test]
    fn test_samples_averaged_and_drained() {
        let health = HealthAggregator::new();
        health.record_sample(10.0, 40.0);
        health.record_sample(30.0, 60.0);

        let report = health.build_snapshot();
        assert_eq!(report.cpu_usage, 20.0);
        assert_eq!(report.memory_usage, 50.0);

        let next = health.build_snapshot();
        assert_eq!(next.cpu_usage, 0.0);
    }

    #[test]
    fn test_decrement_keeps_gauge_sane() {
        let health = HealthAggregator::new();
        health.increment_connection();
        health.decrement_connection();
        health.decrement_connection();

        let report = health.build_snapshot();
        assert_eq!(report.active_connections, 0);
    }

    #[test]
    fn test_labels() {
        let health = HealthAggregator::new();
        health.set_labels("worker-9", "ap-south");

        let report = health.build_snapshot();
        assert_eq!(report.worker_name, "worker-9");
        assert_eq!(report.region, "ap-south");
    }
}
