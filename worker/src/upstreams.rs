//! Round-robin upstream selection

use armada_protocol::UpstreamEntry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An upstream proxy endpoint this worker can forward through
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub id: i64,
    pub tag: String,
    pub format: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub provider: String,
    pub weight: f64,
}

impl Upstream {
    /// `host:port` dial address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<UpstreamEntry> for Upstream {
    fn from(entry: UpstreamEntry) -> Self {
        Self {
            id: entry.upstream_id,
            tag: entry.upstream_tag,
            format: entry.upstream_format,
            username: entry.upstream_username,
            password: entry.upstream_password,
            host: entry.upstream_host,
            port: entry.upstream_port,
            provider: entry.upstream_provider,
            weight: entry.weight,
        }
    }
}

/// Round-robin selector over the current upstream set
///
/// A config push replaces the whole set and restarts the cycle. Under
/// a fixed set, `next` visits every member once per cycle in insertion
/// order, then repeats.
pub struct UpstreamSelector {
    upstreams: RwLock<Vec<Upstream>>,
    robin_counter: AtomicUsize,
}

impl UpstreamSelector {
    pub fn new() -> Self {
        Self {
            upstreams: RwLock::new(Vec::new()),
            robin_counter: AtomicUsize::new(0),
        }
    }

    /// Replace the selectable set wholesale
    pub fn set_upstreams(&self, upstreams: Vec<Upstream>) {
        let mut guard = self.upstreams.write();
        *guard = upstreams;
        self.robin_counter.store(0, Ordering::Relaxed);
    }

    /// Next upstream by round robin, or `None` if the set is empty
    pub fn next(&self) -> Option<Upstream> {
        let guard = self.upstreams.read();
        if guard.is_empty() {
            return None;
        }

        let slot = self.robin_counter.fetch_add(1, Ordering::Relaxed) % guard.len();
        Some(guard[slot].clone())
    }

    pub fn has_upstreams(&self) -> bool {
        !self.upstreams.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.upstreams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.read().is_empty()
    }
}

impl Default for UpstreamSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn upstream(id: i64, host: &str) -> Upstream {
        Upstream {
            id,
            tag: format!("up-{}", id),
            format: "socks5".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            host: host.to_string(),
            port: 1080,
            provider: "acme".to_string(),
            weight: 1.0,
        }
    }

    #[test]
    fn test_full_cycle_permutation() {
        let selector = UpstreamSelector::new();
        selector.set_upstreams(vec![
            upstream(1, "a"),
            upstream(2, "b"),
            upstream(3, "c"),
        ]);

        let hosts: Vec<String> = (0..4)
            .map(|_| selector.next().unwrap().host)
            .collect();

        assert_eq!(hosts, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_empty_set() {
        let selector = UpstreamSelector::new();
        assert!(!selector.has_upstreams());
        assert!(selector.next().is_none());

        selector.set_upstreams(vec![upstream(1, "a")]);
        selector.set_upstreams(vec![]);
        assert!(!selector.has_upstreams());
        assert!(selector.next().is_none());
    }

    #[test]
    fn test_replacement_restarts_cycle() {
        let selector = UpstreamSelector::new();
        selector.set_upstreams(vec![upstream(1, "a"), upstream(2, "b")]);

        assert_eq!(selector.next().unwrap().host, "a");
        assert_eq!(selector.next().unwrap().host, "b");

        selector.set_upstreams(vec![upstream(3, "c"), upstream(4, "d")]);
        assert_eq!(selector.next().unwrap().host, "c");
    }

    #[test]
    fn test_address() {
        let up = upstream(1, "10.0.0.1");
        assert_eq!(up.address(), "10.0.0.1:1080");
    }
}
