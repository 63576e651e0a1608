//! Event envelope and per-type payloads

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::{HealthReport, UsageRecord};
use crate::user::UserPayload;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] serde_json::Error),

    #[error("invalid pool encoding: {0:?}")]
    InvalidPoolEncoding(String),
}

/// Control-channel event envelope
///
/// The event vocabulary is fixed. An inbound message with an unknown
/// `type` tag fails to decode and is dropped by the receiver; it never
/// reaches application code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// Captain -> worker: full routing configuration (replaces prior state)
    Config(ConfigPayload),

    /// Worker -> captain: verify an end-user credential
    VerifyUser(VerifyUserPayload),

    /// Captain -> worker: verification response carrying the user record
    LoginSuccess(UserPayload),

    /// Worker -> captain: per-connection usage report
    TelemetryUsage(UsageRecord),

    /// Worker -> captain: aggregated health snapshot
    TelemetryHealth(HealthReport),

    /// Either direction: non-fatal handler failure
    Error(ErrorPayload),

    /// Captain -> worker: cached user record is stale
    UserChange(UserChange),

    /// Captain -> worker: pool definition changed
    PoolChange(PoolChange),
}

impl Event {
    /// Type tag for logging and routing diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Config(_) => "config",
            Event::VerifyUser(_) => "verify_user",
            Event::LoginSuccess(_) => "login_success",
            Event::TelemetryUsage(_) => "telemetry_usage",
            Event::TelemetryHealth(_) => "telemetry_health",
            Event::Error(_) => "error",
            Event::UserChange(_) => "user_change",
            Event::PoolChange(_) => "pool_change",
        }
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Routing configuration pushed by captain
///
/// A config push always fully supersedes prior routing state on the
/// worker; there are no partial updates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigPayload {
    pub worker_name: String,
    pub region: String,
    pub pool_id: i64,
    pub pool_tag: String,
    pub pool_port: u16,
    pub pool_subdomain: String,
    pub upstreams: Vec<UpstreamEntry>,
}

/// One upstream proxy endpoint inside a config push
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpstreamEntry {
    pub upstream_id: i64,
    pub upstream_tag: String,
    pub upstream_format: String,
    pub upstream_username: String,
    pub upstream_password: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_provider: String,
    pub weight: f64,
}

/// End-user credential submitted for remote verification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerifyUserPayload {
    pub username: String,
    pub password: String,
}

/// Non-fatal error notice written back to the peer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub success: bool,
    pub payload: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: message.into(),
        }
    }
}

/// Invalidation notice for a single cached user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserChange {
    pub username: String,
}

/// Invalidation notice for a pool definition
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolChange {
    pub pool_id: i64,
}

/// Body of the out-of-band `POST /login` request
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub worker_id: String,
}

/// Response to a successful login: the one-time token
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub otp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let event = Event::VerifyUser(VerifyUserPayload {
            username: "alice".to_string(),
            password: "secret".to_string(),
        });

        let raw = event.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["type"], "verify_user");
        assert_eq!(value["payload"]["username"], "alice");
    }

    #[test]
    fn test_roundtrip() {
        let event = Event::Config(ConfigPayload {
            worker_name: "worker-1".to_string(),
            region: "eu-west".to_string(),
            pool_id: 7,
            pool_tag: "residential".to_string(),
            pool_port: 8080,
            pool_subdomain: "res".to_string(),
            upstreams: vec![UpstreamEntry {
                upstream_id: 1,
                upstream_tag: "up-1".to_string(),
                upstream_format: "socks5".to_string(),
                upstream_username: "u".to_string(),
                upstream_password: "p".to_string(),
                upstream_host: "10.0.0.1".to_string(),
                upstream_port: 1080,
                upstream_provider: "acme".to_string(),
                weight: 1.0,
            }],
        });

        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"reboot_everything","payload":{}}"#;
        assert!(Event::decode(raw).is_err());
    }

    #[test]
    fn test_error_payload_shape() {
        let event = Event::Error(ErrorPayload::new("handler failed"));
        let raw = event.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["payload"]["success"], false);
        assert_eq!(value["payload"]["payload"], "handler failed");
    }

    #[test]
    fn test_kind() {
        let event = Event::PoolChange(PoolChange { pool_id: 3 });
        assert_eq!(event.kind(), "pool_change");
    }
}
