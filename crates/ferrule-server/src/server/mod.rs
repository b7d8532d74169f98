pub mod chain;
pub mod config;
pub mod factory;
pub mod grpc_server;
pub mod health;
pub mod http_server;
pub mod info;
pub mod interceptor;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use chain::{ChainBuilder, Concern, InterceptorChain, InterceptorLayer};
pub use grpc_server::{GrpcServer, GrpcServerBuilder};
pub use http_server::{HttpServer, HttpServerBuilder};
pub use lifecycle::Lifecycle;
pub use listener::{InMemoryListener, ListenerMode};
