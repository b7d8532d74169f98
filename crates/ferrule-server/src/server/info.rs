//! Introspection of a built server.

use crate::server::chain::Concern;
use crate::server::listener::ListenerKind;
use ferrule_core::call::Protocol;
use ferrule_core::state::ServerState;
use serde::Serialize;

/// Snapshot of what a server exposes and how it is wrapped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub protocol: Protocol,
    pub state: ServerState,
    pub listener: ListenerKind,
    /// Bound socket address, once serving on a network listener.
    pub address: Option<String>,
    /// gRPC service names, or `METHOD /path` HTTP routes.
    pub endpoints: Vec<String>,
    pub concerns: Vec<Concern>,
    pub reflection: bool,
    pub healthcheck: bool,
}

impl ServerInfo {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
