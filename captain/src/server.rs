//! HTTP login endpoint and WebSocket upgrade handling

use anyhow::Result;
use armada_protocol::{Event, LoginRequest, LoginResponse};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::collaborators::Directory;
use crate::config::CaptainConfig;
use crate::registry::ConnectionRegistry;
use crate::token::TokenRegistry;

/// Shared captain state handed to every request handler
pub struct Captain {
    pub config: CaptainConfig,
    pub tokens: Arc<TokenRegistry>,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<dyn Directory>,
}

/// Accept loop for the captain's HTTP/WebSocket port
pub async fn run(captain: Arc<Captain>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(captain.config.server.bind).await?;
    info!("Captain listening on {}", captain.config.server.bind);

    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => {
                info!("Captain server shutting down");
                return Ok(());
            }
        };
        debug!("New connection from {}", addr);

        let captain = captain.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let captain = captain.clone();
                async move { handle_request(req, captain).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Handle HTTP request
async fn handle_request(
    req: Request<Incoming>,
    captain: Arc<Captain>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();

    let response = match path {
        "/login" => handle_login(req, &captain).await,
        "/connect" => handle_connect(req, captain.clone()).await,
        "/health" => handle_health().await,
        _ => plain_status(StatusCode::NOT_FOUND, "Not Found"),
    };

    match response {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!("Request error: {}", e);
            Ok(Response::builder()
                .status(500)
                .body(Full::new(Bytes::from("Internal Server Error")))
                .unwrap())
        }
    }
}

/// Handle a worker login: credential check, then a one-time token
async fn handle_login(
    req: Request<Incoming>,
    captain: &Captain,
) -> Result<Response<Full<Bytes>>> {
    if req.method() != Method::POST {
        return plain_status(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    let body = req.into_body().collect().await?.to_bytes();
    let login: LoginRequest = match serde_json::from_slice(&body) {
        Ok(login) => login,
        Err(_) => return plain_status(StatusCode::BAD_REQUEST, "Bad Request"),
    };

    match captain.directory.authenticate_worker(&login.worker_id).await {
        Some(_) => {
            let otp = captain.tokens.issue(&login.worker_id);
            info!("Issued token for worker {}", login.worker_id);
            json_response(&LoginResponse { otp })
        }
        None => {
            warn!("Login rejected for unknown worker {}", login.worker_id);
            plain_status(StatusCode::UNAUTHORIZED, "Unauthorized")
        }
    }
}

/// Handle the WebSocket upgrade carrying a redeemed token
async fn handle_connect(
    req: Request<Incoming>,
    captain: Arc<Captain>,
) -> Result<Response<Full<Bytes>>> {
    // The API key authenticates the upgrade request itself; the token
    // only binds the worker identity
    let authorized = req
        .headers()
        .get("x-armada-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == captain.config.server.api_key)
        .unwrap_or(false);

    if !authorized {
        warn!("Upgrade rejected: missing or invalid API key");
        return plain_status(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let worker_id = match query_param(req.uri().query(), "otp")
        .and_then(|otp| captain.tokens.redeem(&otp))
    {
        Some(worker_id) => worker_id,
        None => {
            warn!("Upgrade rejected: invalid or already-redeemed token");
            return plain_status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    let is_upgrade = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_upgrade {
        return plain_status(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade");
    }

    let accept_key = match req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
    {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return plain_status(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"),
    };

    let profile = match captain.directory.authenticate_worker(&worker_id).await {
        Some(profile) => profile,
        None => {
            warn!("Worker {} vanished between login and upgrade", worker_id);
            return plain_status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                serve_worker(ws, worker_id, profile.pool_id, captain).await;
            }
            Err(e) => error!("Upgrade error: {}", e),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(Full::new(Bytes::new()))
        .unwrap())
}

/// Per-worker connection lifecycle: register, push config, route events
async fn serve_worker<S>(
    ws: WebSocketStream<S>,
    worker_id: String,
    pool_id: i64,
    captain: Arc<Captain>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    info!("Worker {} connected", worker_id);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let generation = captain.registry.register(&worker_id, pool_id, tx);

    // Writer task: single serialization point for this connection.
    // Ends when the handle is dropped (disconnect or supersession).
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
                debug!("Write to worker failed: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Every accepted worker immediately receives its routing state
    match captain.directory.worker_config(&worker_id).await {
        Some(config) => {
            if let Err(e) = captain.registry.send_to(&worker_id, Event::Config(config)) {
                warn!("Could not push config to {}: {}", worker_id, e);
            }
        }
        None => warn!("No configuration on record for worker {}", worker_id),
    }

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(raw)) => {
                // A malformed event is dropped; the connection stays open
                let event = match Event::decode(raw.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Dropping malformed event from {}: {}", worker_id, e);
                        continue;
                    }
                };
                captain.registry.dispatch(&worker_id, event).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from worker {} failed: {}", worker_id, e);
                break;
            }
        }
    }

    captain.registry.unregister(&worker_id, generation);
    let _ = writer.await;
    info!("Worker {} disconnected", worker_id);
}

/// Handle health check
async fn handle_health() -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(r#"{"status":"healthy"}"#)))
        .unwrap())
}

fn plain_status(status: StatusCode, body: &'static str) -> Result<Response<Full<Bytes>>> {
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

fn json_response<T: serde::Serialize>(value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
