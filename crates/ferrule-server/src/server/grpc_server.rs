//! gRPC server assembly.
//!
//! Resolves the registry, builds the interceptor chain and the transport,
//! installs health and reflection, and hands the result to a [`Lifecycle`].

use crate::server::chain::{ChainBuilder, Concern, InterceptorLayer};
use crate::server::config::{AppConfig, GrpcConfig};
use crate::server::factory::{DefaultGrpcServerFactory, GrpcServerFactory, GrpcServerOptions};
use crate::server::health::{HealthChecker, HealthService};
use crate::server::info::ServerInfo;
use crate::server::interceptor::metrics::{metric_prefix, parse_buckets};
use crate::server::interceptor::{LoggingSettings, MetricsRecorder, MetricsRegistry};
use crate::server::lifecycle::{BoundListener, Lifecycle};
use crate::server::listener::{InMemoryListener, ListenerMode};
use crate::server::registry::GrpcRegistry;
use ferrule_core::call::{CallTable, Protocol, ServiceDescriptor};
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::id::IdGenerator;
use ferrule_core::state::ServerState;
use ferrule_core::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::server::NamedService;
use tonic_health::pb::health_server::HealthServer;
use tower::layer::util::{Identity, Stack};

/// Router produced by a [`GrpcServerBuilder`], ready to serve.
pub type GrpcRouter = tonic::transport::server::Router<Stack<InterceptorLayer, Identity>>;

const HEALTH_SERVICE: &str = <HealthServer<HealthService> as NamedService>::NAME;

pub struct GrpcServerBuilder {
    registry: GrpcRegistry,
    mode: ListenerMode,
    factory: Arc<dyn GrpcServerFactory>,
    options: GrpcServerOptions,
    debug: bool,
    health: Option<Arc<dyn HealthChecker>>,
    tracing: Option<ExclusionRules>,
    logging: LoggingSettings,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl GrpcServerBuilder {
    pub fn new(registry: GrpcRegistry, mode: ListenerMode) -> Self {
        Self {
            registry,
            mode,
            factory: Arc::new(DefaultGrpcServerFactory),
            options: GrpcServerOptions::default(),
            debug: false,
            health: None,
            tracing: None,
            logging: LoggingSettings::default(),
            metrics: None,
            ids: None,
        }
    }

    /// Builder configured from the `grpc` section. Metrics, when enabled,
    /// are registered on `metrics` under `namespace_subsystem`.
    pub fn from_config(
        registry: GrpcRegistry,
        app: &AppConfig,
        config: &GrpcConfig,
        metrics: &MetricsRegistry,
    ) -> Self {
        let mode = ListenerMode::select(app.is_test(), config.addr, config.test_buffer_size);
        let exclusions = ExclusionRules::exact(config.log.exclude.iter().cloned());
        let logging = config
            .log
            .fields
            .iter()
            .fold(LoggingSettings::new().exclusions(exclusions), |s, (key, field)| {
                s.field(key, field)
            });

        let mut builder = Self::new(registry, mode).debug(app.debug).logging(logging);
        builder.options.reflection = config.reflection;
        if config.trace.enabled {
            builder = builder.tracing(ExclusionRules::exact(config.trace.exclude.iter().cloned()));
        }
        if config.metrics.enabled {
            let prefix = metric_prefix(&config.metrics.namespace, &config.metrics.subsystem);
            let buckets = parse_buckets(&config.metrics.buckets);
            builder = builder.metrics(metrics.register(Protocol::Grpc, &prefix, &buckets, false));
        }
        builder
    }

    pub fn factory(mut self, factory: Arc<dyn GrpcServerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn options(mut self, options: GrpcServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds an encoded `FileDescriptorSet` to the reflection service.
    pub fn file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.options.file_descriptor_sets.push(encoded);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Serves `grpc.health.v1.Health` backed by `checker`.
    pub fn healthcheck(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.health = Some(checker);
        self
    }

    pub fn tracing(mut self, exclusions: ExclusionRules) -> Self {
        self.tracing = Some(exclusions);
        self
    }

    pub fn logging(mut self, settings: LoggingSettings) -> Self {
        self.logging = settings;
        self
    }

    pub fn metrics(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(recorder);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<GrpcServer> {
        let registrations = self.registry.resolve()?;
        if self.health.is_some()
            && registrations
                .iter()
                .any(|r| r.descriptor().name() == HEALTH_SERVICE)
        {
            return Err(Error::DuplicateRegistration {
                identity: HEALTH_SERVICE.to_owned(),
            });
        }

        let mut table = CallTable::from_services(registrations.iter().map(|r| r.descriptor()));
        let mut options = self.options;
        if self.health.is_some() {
            table.insert_service(
                &ServiceDescriptor::new(HEALTH_SERVICE)
                    .unary("Check")
                    .server_streaming("Watch"),
            );
            if options.reflection {
                options
                    .file_descriptor_sets
                    .push(tonic_health::pb::FILE_DESCRIPTOR_SET);
            }
        }

        let transport = self.factory.create(&options)?;

        let mut chain = ChainBuilder::new(Protocol::Grpc, table)
            .debug(self.debug)
            .with_logging(self.logging);
        if let Some(exclusions) = self.tracing {
            chain = chain.with_tracing(exclusions);
        }
        if let Some(recorder) = self.metrics {
            chain = chain.with_metrics(recorder);
        }
        if let Some(ids) = self.ids {
            chain = chain.with_id_generator(ids);
        }
        let chain = chain.build();

        let mut routes = transport.routes;
        let mut services = Vec::with_capacity(registrations.len() + 1);
        let healthcheck = self.health.is_some();
        if let Some(checker) = self.health {
            routes.add_service(HealthServer::new(HealthService::new(checker)));
            services.push(HEALTH_SERVICE.to_owned());
        }
        for registration in registrations {
            tracing::debug!(service = registration.descriptor().name(), "registering grpc service");
            services.push(registration.descriptor().name().to_owned());
            registration.install(&mut routes);
        }

        let router = transport
            .server
            .layer(chain.layer())
            .add_routes(routes.routes());

        Ok(GrpcServer {
            router,
            lifecycle: Lifecycle::new("grpc", self.mode),
            services,
            concerns: chain.concerns().to_vec(),
            reflection: options.reflection,
            healthcheck,
        })
    }
}

/// A built gRPC server.
#[derive(Debug)]
pub struct GrpcServer {
    router: GrpcRouter,
    lifecycle: Lifecycle,
    services: Vec<String>,
    concerns: Vec<Concern>,
    reflection: bool,
    healthcheck: bool,
}

impl GrpcServer {
    /// Binds the listener and serves in the background.
    pub async fn start(&self) -> Result<()> {
        let router = self.router.clone();
        self.lifecycle
            .start(move |bound, shutdown| async move {
                let served = match bound {
                    BoundListener::Tcp(listener) => {
                        router
                            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                            .await
                    }
                    BoundListener::InMemory(acceptor) => {
                        router
                            .serve_with_incoming_shutdown(acceptor.into_incoming(), shutdown)
                            .await
                    }
                };
                served.map_err(|e| Error::Serve(e.to_string()))
            })
            .await
    }

    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.lifecycle.stop(deadline).await
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    /// The in-memory listener, when serving in test mode.
    pub fn in_memory_listener(&self) -> Option<&InMemoryListener> {
        match self.lifecycle.mode() {
            ListenerMode::InMemory(listener) => Some(listener),
            ListenerMode::Network { .. } => None,
        }
    }

    pub fn concerns(&self) -> &[Concern] {
        &self.concerns
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            protocol: Protocol::Grpc,
            state: self.state(),
            listener: self.lifecycle.mode().kind(),
            address: self.local_addr().map(|a| a.to_string()),
            endpoints: self.services.clone(),
            concerns: self.concerns.clone(),
            reflection: self.reflection,
            healthcheck: self.healthcheck,
        }
    }
}
