//! One-time token registry
//!
//! Workers exchange a login for a single-use token, then present it on
//! the WebSocket upgrade. Tokens are server-side map entries; redeeming
//! one removes it no matter the outcome, so a key can never be replayed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

struct IssuedToken {
    worker_id: String,
    issued_at: Instant,
}

/// Registry of outstanding one-time tokens
///
/// A single coarse lock guards the map; token volume is bounded by the
/// worker login rate, so contention is negligible.
pub struct TokenRegistry {
    tokens: Mutex<HashMap<String, IssuedToken>>,
    retention: Duration,
}

impl TokenRegistry {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(HashMap::new()),
            retention,
        })
    }

    /// Issue a fresh token bound to a worker identity
    pub fn issue(&self, worker_id: &str) -> String {
        let key = Uuid::new_v4().to_string();

        self.tokens.lock().insert(
            key.clone(),
            IssuedToken {
                worker_id: worker_id.to_string(),
                issued_at: Instant::now(),
            },
        );

        trace!("Issued token for worker {}", worker_id);
        key
    }

    /// Redeem a token, returning the bound worker identity if it is
    /// still valid
    ///
    /// The entry is removed regardless of the outcome, so a second
    /// redemption of the same key always fails.
    pub fn redeem(&self, key: &str) -> Option<String> {
        let token = self.tokens.lock().remove(key)?;

        if token.issued_at.elapsed() > self.retention {
            debug!("Rejected expired token for worker {}", token.worker_id);
            return None;
        }

        Some(token.worker_id)
    }

    /// Remove tokens older than the retention window
    pub fn sweep(&self) {
        let retention = self.retention;
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|_, token| token.issued_at.elapsed() <= retention);

        let removed = before - tokens.len();
        if removed > 0 {
            debug!("Swept {} expired tokens", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Start the background sweep loop
    pub fn start_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep(),
                    _ = shutdown.changed() => {
                        debug!("Token sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeem_is_single_use() {
        let registry = TokenRegistry::new(Duration::from_secs(60));
        let key = registry.issue("worker-1");

        assert_eq!(registry.redeem(&key), Some("worker-1".to_string()));
        assert_eq!(registry.redeem(&key), None);
    }

    #[test]
    fn test_unknown_key() {
        let registry = TokenRegistry::new(Duration::from_secs(60));
        assert_eq!(registry.redeem("no-such-token"), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let registry = TokenRegistry::new(Duration::from_millis(10));
        let key = registry.issue("worker-1");

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(registry.redeem(&key), None);
        // The entry is gone even though redemption failed
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_removes_stale_tokens() {
        let registry = TokenRegistry::new(Duration::from_millis(10));
        registry.issue("worker-1");
        registry.issue("worker-2");
        assert_eq!(registry.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        let fresh = registry.issue("worker-3");

        registry.sweep();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.redeem(&fresh), Some("worker-3".to_string()));
    }
}
