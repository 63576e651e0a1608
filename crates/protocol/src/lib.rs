//! Armada Protocol - control-channel event definitions
//!
//! This crate defines the messages exchanged between captain and workers:
//! - `Event`: the tagged envelope carried over the persistent connection
//! - `ConfigPayload`/`UpstreamEntry`: routing configuration pushes
//! - `UserPayload`/`PoolLimit`: user verification responses
//! - `UsageRecord`/`HealthReport`: telemetry
//!
//! Everything on the wire is a JSON object of the form
//! `{"type": <tag>, "payload": <object>}`, decoded once into a typed
//! variant at the connection boundary.

mod event;
mod telemetry;
mod user;

pub use event::*;
pub use telemetry::*;
pub use user::*;
