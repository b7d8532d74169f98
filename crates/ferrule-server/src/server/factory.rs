//! Transport server construction.
//!
//! Factories only build the bare transport: the interceptor chain and the
//! registered services are wired on top by the server builders. Swap the
//! default factory to tune the transport without touching the wiring.

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use ferrule_core::{Error, Result};
use std::time::Duration;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;

/// Options handed to a [`GrpcServerFactory`].
#[derive(Debug, Clone)]
pub struct GrpcServerOptions {
    /// Expose `grpc.reflection.v1.ServerReflection`.
    pub reflection: bool,
    /// Encoded `FileDescriptorSet`s served by reflection.
    pub file_descriptor_sets: Vec<&'static [u8]>,
    pub accept_http1: bool,
    pub timeout: Option<Duration>,
    pub concurrency_limit_per_connection: Option<usize>,
    pub http2_keepalive_interval: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for GrpcServerOptions {
    fn default() -> Self {
        Self {
            reflection: false,
            file_descriptor_sets: Vec::new(),
            accept_http1: true,
            timeout: None,
            concurrency_limit_per_connection: None,
            http2_keepalive_interval: None,
            tcp_nodelay: true,
        }
    }
}

/// A configured server plus the routes it starts with.
#[derive(Debug)]
pub struct GrpcTransport {
    pub server: Server,
    pub routes: RoutesBuilder,
}

pub trait GrpcServerFactory: Send + Sync {
    fn create(&self, options: &GrpcServerOptions) -> Result<GrpcTransport>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultGrpcServerFactory;

impl GrpcServerFactory for DefaultGrpcServerFactory {
    fn create(&self, options: &GrpcServerOptions) -> Result<GrpcTransport> {
        if options.concurrency_limit_per_connection == Some(0) {
            return Err(Error::ServerCreation {
                reason: "concurrency limit per connection must be greater than 0".to_owned(),
            });
        }
        if options.timeout == Some(Duration::ZERO) {
            return Err(Error::ServerCreation {
                reason: "request timeout must be greater than 0".to_owned(),
            });
        }

        let mut server = Server::builder()
            .accept_http1(options.accept_http1)
            .http2_adaptive_window(Some(true))
            .tcp_nodelay(options.tcp_nodelay)
            .http2_keepalive_interval(options.http2_keepalive_interval);
        if let Some(timeout) = options.timeout {
            server = server.timeout(timeout);
        }
        if let Some(limit) = options.concurrency_limit_per_connection {
            server = server.concurrency_limit_per_connection(limit);
        }

        let mut routes = RoutesBuilder::default();
        if options.reflection {
            let reflection = options
                .file_descriptor_sets
                .iter()
                .fold(tonic_reflection::server::Builder::configure(), |b, set| {
                    b.register_encoded_file_descriptor_set(set)
                })
                .build_v1()
                .map_err(|e| Error::ServerCreation {
                    reason: format!("reflection: {e}"),
                })?;
            routes.add_service(reflection);
        }

        Ok(GrpcTransport { server, routes })
    }
}

/// Options handed to an [`HttpServerFactory`].
#[derive(Debug, Clone, Default)]
pub struct HttpServerOptions {
    pub debug: bool,
    /// Hide error details in JSON error payloads.
    pub obfuscate_errors: bool,
}

pub trait HttpServerFactory: Send + Sync {
    /// Returns the base router registered routes are added to.
    fn create(&self, options: &HttpServerOptions) -> Result<Router>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHttpServerFactory;

impl HttpServerFactory for DefaultHttpServerFactory {
    fn create(&self, options: &HttpServerOptions) -> Result<Router> {
        let detailed = options.debug && !options.obfuscate_errors;
        Ok(Router::new().fallback(move |uri: axum::http::Uri| async move {
            let message = if detailed {
                format!("no route for {}", uri.path())
            } else {
                "Not Found".to_owned()
            };
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "message": message })),
            )
                .into_response()
        }))
    }
}
