//! Control channel to captain
//!
//! The worker keeps exactly one persistent connection to captain at a
//! time. Login happens first over an ordinary HTTP request and yields a
//! one-time token; the WebSocket upgrade then presents that token as a
//! query parameter. Any read or write failure drops the session and the
//! supervised loop retries after a fixed delay, forever.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, error, info, trace, warn};

use armada_protocol::{Event, LoginRequest, LoginResponse, ProtocolError};

use crate::config::CaptainEndpoint;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control channel is not connected")]
    NotConnected,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Control-channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    LoggingIn,
    Connected,
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_LOGGING_IN: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// Receives inbound control events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event);
}

/// Anything that can enqueue an event onto the control channel
pub trait EventSink: Send + Sync {
    fn send_event(&self, event: Event) -> Result<(), ControlError>;
}

type OutboundSlot = Arc<RwLock<Option<UnboundedSender<Event>>>>;

/// Cheap cloneable handle for enqueueing outbound events
///
/// The slot holds the live connection's sender; while disconnected it
/// is empty and sends fail immediately, so best-effort callers drop
/// their events instead of queueing them across reconnects.
#[derive(Clone)]
pub struct ControlSender {
    outbound: OutboundSlot,
}

impl ControlSender {
    pub fn send(&self, event: Event) -> Result<(), ControlError> {
        match self.outbound.read().as_ref() {
            Some(tx) => tx.send(event).map_err(|_| ControlError::NotConnected),
            None => Err(ControlError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.read().is_some()
    }
}

impl EventSink for ControlSender {
    fn send_event(&self, event: Event) -> Result<(), ControlError> {
        self.send(event)
    }
}

/// The worker's single persistent connection to captain
pub struct ControlChannel {
    endpoint: CaptainEndpoint,
    retry_delay: Duration,
    http: reqwest::Client,
    outbound: OutboundSlot,
    state: AtomicU8,
}

impl ControlChannel {
    pub fn new(endpoint: CaptainEndpoint, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            retry_delay,
            http: reqwest::Client::new(),
            outbound: Arc::new(RwLock::new(None)),
            state: AtomicU8::new(STATE_DISCONNECTED),
        })
    }

    pub fn sender(&self) -> ControlSender {
        ControlSender {
            outbound: self.outbound.clone(),
        }
    }

    pub fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Relaxed) {
            STATE_LOGGING_IN => ChannelState::LoggingIn,
            STATE_CONNECTED => ChannelState::Connected,
            _ => ChannelState::Disconnected,
        }
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Relaxed);
    }

    /// Supervised reconnect loop
    ///
    /// Session failures are a liveness concern, never fatal: the loop
    /// sleeps the retry delay and tries again until shutdown.
    pub fn start(
        self: Arc<Self>,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match self.run_session(handler.clone(), &mut shutdown).await {
                    Ok(()) => info!("Control channel closed"),
                    Err(e) => warn!("Control channel failed: {}", e),
                }

                self.set_state(STATE_DISCONNECTED);

                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = shutdown.changed() => break,
                }
            }

            self.set_state(STATE_DISCONNECTED);
            debug!("Control loop shutting down");
        })
    }

    /// One login + connect + read-loop lifetime
    async fn run_session(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ControlError> {
        self.set_state(STATE_LOGGING_IN);
        let otp = self.login().await?;

        let url = format!("{}/connect?otp={}", ws_base(&self.endpoint.url), otp);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "x-armada-key",
            self.endpoint
                .api_key
                .parse()
                .map_err(|_| ControlError::ConnectionFailed("invalid API key header".to_string()))?,
        );

        debug!("Connecting to {}", url);
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;

        info!("Control channel connected");
        self.set_state(STATE_CONNECTED);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        *self.outbound.write() = Some(tx);

        // Writer task: the single serialization point for the many
        // concurrent outbound callers
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let raw = match event.encode() {
                    Ok(raw) => raw,
                    Err(e) => {
                        error!("Event encoding error: {}", e);
                        continue;
                    }
                };

                if let Err(e) = ws_tx.send(Message::Text(raw.into())).await {
                    debug!("Control write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let result = loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                _ = shutdown.changed() => break Ok(()),
            };

            match msg {
                Some(Ok(Message::Text(raw))) => match Event::decode(raw.as_str()) {
                    Ok(event) => {
                        trace!("Received {} event", event.kind());
                        handler.handle_event(event).await;
                    }
                    // Malformed events are dropped; the connection stays up
                    Err(e) => warn!("Dropping malformed event: {}", e),
                },
                Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(ControlError::ConnectionFailed(e.to_string())),
                None => {
                    break Err(ControlError::ConnectionFailed(
                        "connection closed".to_string(),
                    ));
                }
            }
        };

        // Clearing the slot drops the only sender, which ends the
        // writer task and closes the socket
        *self.outbound.write() = None;
        let _ = writer.await;

        result
    }

    /// Out-of-band login: trade the worker identity for a one-time token
    async fn login(&self) -> Result<String, ControlError> {
        let url = format!("{}/login", self.endpoint.url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                worker_id: self.endpoint.worker_id.clone(),
            })
            .send()
            .await
            .map_err(|e| ControlError::LoginFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ControlError::LoginFailed(format!(
                "captain returned {}",
                response.status()
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ControlError::LoginFailed(e.to_string()))?;

        Ok(login.otp)
    }
}

/// Map the captain's HTTP base URL onto the WebSocket scheme
fn ws_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}
