//! Errors raised while building, starting or stopping a server.
//!
//! Only build-time failures surface here. Per-call faults are converted to
//! call results by the recovery interceptor and instrumentation failures are
//! swallowed where they happen.

use crate::state::ServerState;
use std::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Two registrations share the same identity (service name for RPC,
    /// method and path for HTTP).
    #[error("duplicate registration: {identity}")]
    DuplicateRegistration { identity: String },

    /// An HTTP handler was registered with a method axum cannot route.
    #[error("unsupported http method {method} for route {path}")]
    UnsupportedMethod { method: String, path: String },

    /// An HTTP route or group prefix the router cannot hold.
    #[error("invalid route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },

    /// The server factory could not produce a transport server.
    #[error("failed to create server: {reason}")]
    ServerCreation { reason: String },

    /// The network listener could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server state transition from {from} to {to}")]
    InvalidTransition { from: ServerState, to: ServerState },

    /// The in-memory listener's accept side was already handed to a server.
    #[error("in-memory listener already consumed")]
    ListenerConsumed,

    /// In-flight calls did not drain before the deadline.
    #[error("graceful drain did not complete within {0:?}")]
    DrainTimeout(Duration),

    #[error("server failed while serving: {0}")]
    Serve(String),
}
