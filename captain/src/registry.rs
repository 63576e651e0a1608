//! Live worker connection registry and inbound event router

use armada_protocol::{ErrorPayload, Event};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::collaborators::{AnalyticsSink, Directory};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("worker {0} is not connected")]
    NotConnected(String),

    #[error("outbound channel for worker {0} is closed")]
    ChannelClosed(String),

    #[error("unexpected {0} event")]
    UnexpectedEvent(&'static str),

    #[error("unknown user {0}")]
    UnknownUser(String),
}

struct WorkerHandle {
    pool_id: i64,
    generation: u64,
    sender: UnboundedSender<Event>,
}

/// Registry of live worker connections
///
/// At most one connection per worker id: a successful registration
/// supersedes the previous handle, whose dropped sender ends the old
/// writer task and closes the old socket.
pub struct ConnectionRegistry {
    connections: DashMap<String, WorkerHandle>,
    generations: AtomicU64,
    directory: Arc<dyn Directory>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl ConnectionRegistry {
    pub fn new(directory: Arc<dyn Directory>, analytics: Arc<dyn AnalyticsSink>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            generations: AtomicU64::new(0),
            directory,
            analytics,
        })
    }

    /// Register a new connection, superseding any prior one
    ///
    /// Returns the connection generation; pass it back to `unregister`
    /// so a superseded socket's teardown cannot evict its replacement.
    pub fn register(&self, worker_id: &str, pool_id: i64, sender: UnboundedSender<Event>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let previous = self.connections.insert(
            worker_id.to_string(),
            WorkerHandle {
                pool_id,
                generation,
                sender,
            },
        );

        if previous.is_some() {
            info!("Superseding existing connection for worker {}", worker_id);
        }

        generation
    }

    /// Evict a connection if it still owns the slot
    pub fn unregister(&self, worker_id: &str, generation: u64) {
        self.connections
            .remove_if(worker_id, |_, handle| handle.generation == generation);
    }

    /// Push an event to a specific worker
    pub fn send_to(&self, worker_id: &str, event: Event) -> Result<(), RegistryError> {
        let handle = self
            .connections
            .get(worker_id)
            .ok_or_else(|| RegistryError::NotConnected(worker_id.to_string()))?;

        handle
            .sender
            .send(event)
            .map_err(|_| RegistryError::ChannelClosed(worker_id.to_string()))
    }

    pub fn is_connected(&self, worker_id: &str) -> bool {
        self.connections.contains_key(worker_id)
    }

    pub fn pool_of(&self, worker_id: &str) -> Option<i64> {
        self.connections.get(worker_id).map(|handle| handle.pool_id)
    }

    /// Number of live connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Route an inbound event to its per-type handler
    pub async fn route(&self, worker_id: &str, event: Event) -> Result<(), RegistryError> {
        match event {
            Event::VerifyUser(request) => {
                let user = self
                    .directory
                    .find_user(&request.username)
                    .await
                    .ok_or_else(|| RegistryError::UnknownUser(request.username.clone()))?;

                debug!(
                    "Verification for {} answered on worker {}'s connection",
                    user.username, worker_id
                );
                self.send_to(worker_id, Event::LoginSuccess(user))
            }
            Event::TelemetryUsage(record) => {
                self.analytics.ingest_usage(worker_id, record).await;
                Ok(())
            }
            Event::TelemetryHealth(report) => {
                self.analytics.ingest_health(worker_id, report).await;
                Ok(())
            }
            Event::Error(notice) => {
                warn!("Worker {} reported an error: {}", worker_id, notice.payload);
                Ok(())
            }
            other => Err(RegistryError::UnexpectedEvent(other.kind())),
        }
    }

    /// Route an inbound event; on handler failure, write an `error`
    /// event back to the originating connection instead of closing it
    pub async fn dispatch(&self, worker_id: &str, event: Event) {
        let kind = event.kind();

        if let Err(e) = self.route(worker_id, event).await {
            warn!("Handler for {} event from {} failed: {}", kind, worker_id, e);

            let notice = Event::Error(ErrorPayload::new(e.to_string()));
            if let Err(e) = self.send_to(worker_id, notice) {
                debug!("Could not report handler failure to {}: {}", worker_id, e);
            }
        }
    }
}
