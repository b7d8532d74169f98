//! Registration collectors.
//!
//! Registrations are accumulated from any number of call sites during
//! process wiring, then resolved exactly once when the server is built.
//! Resolution preserves registration order and rejects duplicates.

pub mod grpc;
pub mod http;

pub use grpc::{GrpcRegistry, ServiceRegistration};
pub use http::{
    HandlerGroup, HandlerRoute, HttpRegistry, Middleware, PreMiddleware, ResolvedRoutes,
};
