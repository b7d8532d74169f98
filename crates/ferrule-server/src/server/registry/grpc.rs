use ferrule_core::call::ServiceDescriptor;
use ferrule_core::{Error, Result};
use http::Request;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tower::Service;

type Install = Box<dyn FnOnce(&mut RoutesBuilder) + Send>;

/// A service implementation paired with its method table.
///
/// The implementation stays opaque: it is moved into the route table when
/// the server is built and never touched before that.
pub struct ServiceRegistration {
    descriptor: ServiceDescriptor,
    install: Install,
}

impl ServiceRegistration {
    pub fn new<S>(descriptor: ServiceDescriptor, service: S) -> Self
    where
        S: Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        Self {
            descriptor,
            install: Box::new(move |routes: &mut RoutesBuilder| {
                routes.add_service(service);
            }),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub(crate) fn install(self, routes: &mut RoutesBuilder) {
        (self.install)(routes);
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Write-once, read-once collector of gRPC services.
#[derive(Debug, Default)]
pub struct GrpcRegistry {
    registrations: Vec<ServiceRegistration>,
}

impl GrpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&mut self, descriptor: ServiceDescriptor, service: S) -> &mut Self
    where
        S: Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.registrations
            .push(ServiceRegistration::new(descriptor, service));
        self
    }

    /// Registers a service under its generated name, without a method
    /// table. Its calls are classified from the request path.
    pub fn register_named<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.register(ServiceDescriptor::new(S::NAME), service)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Validates the registrations and hands them over in registration
    /// order. Two registrations with the same service name are rejected.
    pub fn resolve(self) -> Result<Vec<ServiceRegistration>> {
        let mut seen = HashSet::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            let name = registration.descriptor.name();
            if !seen.insert(name) {
                return Err(Error::DuplicateRegistration {
                    identity: name.to_owned(),
                });
            }
        }
        Ok(self.registrations)
    }
}
