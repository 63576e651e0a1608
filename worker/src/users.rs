//! Verified-user cache and remote verification
//!
//! Credentials the worker has already verified are served from the
//! cache. Anything else round-trips to captain over the control
//! channel: the request is a `verify_user` event, the response arrives
//! asynchronously as `login_success`, and the calling proxy-protocol
//! task waits on a per-username rendezvous with a fixed timeout. On
//! timeout the verification fails closed.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use armada_protocol::{Event, PoolLimit, ProtocolError, UserPayload, UserStatus, VerifyUserPayload};

use crate::control::EventSink;
use crate::upstreams::{Upstream, UpstreamSelector};

#[derive(Error, Debug)]
pub enum UserCacheError {
    #[error("user {0} is not cached")]
    UnknownUser(String),

    #[error("user {0} reached the connection ceiling")]
    TooManyConnections(String),
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct UserCacheConfig {
    /// Cached-user lifetime
    pub ttl: Duration,

    /// Remote verification round-trip timeout
    pub verify_timeout: Duration,

    /// Per-user concurrent connection ceiling
    pub connection_ceiling: u32,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            verify_timeout: Duration::from_secs(5),
            connection_ceiling: 50,
        }
    }
}

/// A verified end user with bounded lifetime
#[derive(Debug, Clone)]
pub struct CachedUser {
    pub id: i64,
    pub username: String,
    password: String,
    status: UserStatus,
    ip_whitelist: Vec<String>,
    pools: Vec<PoolLimit>,
    active_connections: u32,
    affinity: HashMap<String, Upstream>,
    expires_at: Instant,
}

impl CachedUser {
    /// Accept only an active user with a matching password and quota
    /// left in every pool they are bound to
    fn allows(&self, password: &str) -> bool {
        self.status == UserStatus::Active
            && self.password == password
            && self.pools.iter().all(PoolLimit::has_quota)
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct Waiter {
    password: String,
    tx: oneshot::Sender<bool>,
}

/// One in-flight verification; later callers for the same username
/// attach here instead of emitting a second request
struct PendingVerification {
    waiters: Vec<Waiter>,
}

/// Cache of verified users plus the pending-verification table
pub struct UserCache {
    users: DashMap<String, CachedUser>,
    pending: Mutex<HashMap<String, PendingVerification>>,
    sink: Arc<dyn EventSink>,
    config: UserCacheConfig,
}

impl UserCache {
    pub fn new(config: UserCacheConfig, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            users: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            sink,
            config,
        })
    }

    /// Decide whether a credential may open a proxy session
    pub async fn verify(&self, username: &str, password: &str, pool_tag: &str) -> bool {
        let cached = self
            .users
            .get(username)
            .and_then(|user| (!user.is_expired()).then(|| user.allows(password)));

        if let Some(allowed) = cached {
            trace!("Cache hit for {} on pool {}: {}", username, pool_tag, allowed);
            return allowed;
        }

        self.verify_remote(username, password).await
    }

    /// Round-trip the credential to captain and wait for the response
    async fn verify_remote(&self, username: &str, password: &str) -> bool {
        let (tx, rx) = oneshot::channel();

        let is_owner = {
            let mut pending = self.pending.lock();
            match pending.entry(username.to_string()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().waiters.push(Waiter {
                        password: password.to_string(),
                        tx,
                    });
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(PendingVerification {
                        waiters: vec![Waiter {
                            password: password.to_string(),
                            tx,
                        }],
                    });
                    true
                }
            }
        };

        if is_owner {
            let event = Event::VerifyUser(VerifyUserPayload {
                username: username.to_string(),
                password: password.to_string(),
            });

            if let Err(e) = self.sink.send_event(event) {
                warn!("Verification for {} could not be sent: {}", username, e);
                self.pending.lock().remove(username);
                return false;
            }
            debug!("Verification for {} in flight", username);
        }

        match tokio::time::timeout(self.config.verify_timeout, rx).await {
            Ok(Ok(allowed)) => allowed,
            // The table entry was dropped before a response arrived
            Ok(Err(_)) => false,
            Err(_) => {
                if is_owner {
                    self.pending.lock().remove(username);
                    debug!("Verification for {} timed out", username);
                }
                false
            }
        }
    }

    /// Apply a `login_success` response: cache the record and release
    /// every waiter with its own accept/deny outcome
    pub fn complete_verification(&self, payload: &UserPayload) -> Result<(), ProtocolError> {
        let pools = payload.pool_limits()?;

        let mut user = CachedUser {
            id: payload.id,
            username: payload.username.clone(),
            password: payload.password.clone(),
            status: payload.status,
            ip_whitelist: payload.ip_whitelist.clone(),
            pools,
            active_connections: 0,
            affinity: HashMap::new(),
            expires_at: Instant::now() + self.config.ttl,
        };

        // A refresh keeps live connection counts and session bindings
        if let Some((active, affinity)) = self
            .users
            .get(&payload.username)
            .map(|previous| (previous.active_connections, previous.affinity.clone()))
        {
            user.active_connections = active;
            user.affinity = affinity;
        }

        let pending = self.pending.lock().remove(&payload.username);
        let outcomes: Vec<(oneshot::Sender<bool>, bool)> = pending
            .map(|p| {
                p.waiters
                    .into_iter()
                    .map(|waiter| {
                        let allowed = user.allows(&waiter.password);
                        (waiter.tx, allowed)
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.users.insert(payload.username.clone(), user);

        for (tx, allowed) in outcomes {
            let _ = tx.send(allowed);
        }

        Ok(())
    }

    /// Evict a single user immediately
    pub fn invalidate(&self, username: &str) {
        if self.users.remove(username).is_some() {
            debug!("Invalidated cached user {}", username);
        }
    }

    /// Drop every cached record
    pub fn clear(&self) {
        self.users.clear();
    }

    /// Count a new proxy session against the per-user ceiling
    pub fn add_connection(&self, username: &str) -> Result<(), UserCacheError> {
        let mut user = self
            .users
            .get_mut(username)
            .ok_or_else(|| UserCacheError::UnknownUser(username.to_string()))?;

        if user.active_connections >= self.config.connection_ceiling {
            return Err(UserCacheError::TooManyConnections(username.to_string()));
        }

        user.active_connections += 1;
        Ok(())
    }

    pub fn remove_connection(&self, username: &str) {
        if let Some(mut user) = self.users.get_mut(username) {
            user.active_connections = user.active_connections.saturating_sub(1);
        }
    }

    /// Sticky upstream for a user session
    ///
    /// The binding lives as long as the cache entry itself; it has no
    /// expiry of its own.
    pub fn upstream_for_session(
        &self,
        username: &str,
        session_key: &str,
        selector: &UpstreamSelector,
    ) -> Option<Upstream> {
        if let Some(mut user) = self.users.get_mut(username) {
            if let Some(bound) = user.affinity.get(session_key) {
                return Some(bound.clone());
            }

            let fresh = selector.next()?;
            user.affinity.insert(session_key.to_string(), fresh.clone());
            return Some(fresh);
        }

        // No cache entry to bind against; plain round robin
        selector.next()
    }

    /// Remove expired entries
    pub fn sweep(&self) {
        let before = self.users.len();
        self.users.retain(|_, user| !user.is_expired());

        let removed = before - self.users.len();
        if removed > 0 {
            debug!("Swept {} expired users", removed);
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Start the background eviction loop
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
                        debug!("User sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
