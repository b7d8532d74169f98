//! Call identity.
//!
//! A [`CallDescriptor`] names an inbound call and its shape. Descriptors for
//! registered RPC methods are built once, when the server is assembled, and
//! shared across every call through a [`CallTable`]. They are the key for
//! exclusion matching and for metric and log labels.

use http::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Shape of a call on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallKind {
    /// Single request, single response.
    #[default]
    Unary,
    /// Stream of requests, single response.
    ClientStreaming,
    /// Single request, stream of responses.
    ServerStreaming,
    /// Streams in both directions.
    BidiStreaming,
}

impl CallKind {
    pub const fn is_streaming(self) -> bool {
        !matches!(self, Self::Unary)
    }

    /// Label used in logs and the `grpc_type` metric attribute.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ClientStreaming => "client_stream",
            Self::ServerStreaming => "server_stream",
            Self::BidiStreaming => "bidi_stream",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport flavor a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Grpc,
    Http,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
        }
    }
}

/// Immutable identity of an inbound call.
///
/// For gRPC the full name is the request path (`/package.Service/Method`).
/// For HTTP it is `METHOD /route`, where the route is the matched template
/// when one is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    protocol: Protocol,
    full_name: String,
    service: String,
    method: String,
    kind: CallKind,
}

impl CallDescriptor {
    pub fn grpc(service: &str, method: &str, kind: CallKind) -> Self {
        Self {
            protocol: Protocol::Grpc,
            full_name: format!("/{service}/{method}"),
            service: service.to_owned(),
            method: method.to_owned(),
            kind,
        }
    }

    /// Builds a unary descriptor from a raw gRPC request path.
    ///
    /// Paths that do not follow `/service/method` keep the whole path as the
    /// method name and an empty service.
    pub fn from_grpc_path(path: &str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        match trimmed.split_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => {
                Self::grpc(service, method, CallKind::Unary)
            }
            _ => Self {
                protocol: Protocol::Grpc,
                full_name: path.to_owned(),
                service: String::new(),
                method: path.to_owned(),
                kind: CallKind::Unary,
            },
        }
    }

    pub fn http(method: &Method, route: &str) -> Self {
        Self {
            protocol: Protocol::Http,
            full_name: format!("{} {route}", method.as_str()),
            service: route.to_owned(),
            method: method.as_str().to_owned(),
            kind: CallKind::Unary,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Fully qualified service name for gRPC, route for HTTP.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name for gRPC, HTTP verb for HTTP.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// One entry of a service's method table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    name: String,
    kind: CallKind,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }
}

/// Description of a registered RPC service: its fully qualified name and
/// method table.
///
/// ```
/// use ferrule_core::call::{CallKind, ServiceDescriptor};
///
/// let desc = ServiceDescriptor::new("orders.v1.Orders")
///     .unary("Get")
///     .server_streaming("Watch");
/// assert_eq!(desc.methods().len(), 2);
/// assert_eq!(desc.methods()[1].kind(), CallKind::ServerStreaming);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, name: impl Into<String>, kind: CallKind) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn unary(self, name: impl Into<String>) -> Self {
        self.method(name, CallKind::Unary)
    }

    pub fn client_streaming(self, name: impl Into<String>) -> Self {
        self.method(name, CallKind::ClientStreaming)
    }

    pub fn server_streaming(self, name: impl Into<String>) -> Self {
        self.method(name, CallKind::ServerStreaming)
    }

    pub fn bidi_streaming(self, name: impl Into<String>) -> Self {
        self.method(name, CallKind::BidiStreaming)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Call descriptors for every method in the table.
    pub fn calls(&self) -> impl Iterator<Item = CallDescriptor> + '_ {
        self.methods
            .iter()
            .map(|m| CallDescriptor::grpc(&self.name, &m.name, m.kind))
    }
}

/// Path-indexed descriptors, built once at server build time and shared
/// read-only by all interceptors.
#[derive(Debug, Clone, Default)]
pub struct CallTable {
    calls: HashMap<String, Arc<CallDescriptor>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_services<'a>(services: impl IntoIterator<Item = &'a ServiceDescriptor>) -> Self {
        let mut table = Self::new();
        for service in services {
            table.insert_service(service);
        }
        table
    }

    pub fn insert_service(&mut self, service: &ServiceDescriptor) {
        for call in service.calls() {
            self.calls
                .insert(call.full_name().to_owned(), Arc::new(call));
        }
    }

    pub fn get(&self, path: &str) -> Option<&Arc<CallDescriptor>> {
        self.calls.get(path)
    }

    /// Returns the registered descriptor for `path`, or a unary descriptor
    /// parsed from it.
    pub fn resolve_grpc(&self, path: &str) -> Arc<CallDescriptor> {
        match self.calls.get(path) {
            Some(call) => Arc::clone(call),
            None => Arc::new(CallDescriptor::from_grpc_path(path)),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
