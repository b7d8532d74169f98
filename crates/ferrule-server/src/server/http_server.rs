//! HTTP server assembly.
//!
//! Same wiring as the gRPC side on top of axum: the factory provides the
//! base router, registered routes and middlewares are added in registration
//! order and the interceptor chain wraps every routed request.

use crate::server::chain::{ChainBuilder, Concern};
use crate::server::config::{AppConfig, HttpConfig};
use crate::server::factory::{DefaultHttpServerFactory, HttpServerFactory, HttpServerOptions};
use crate::server::info::ServerInfo;
use crate::server::interceptor::metrics::{metric_prefix, parse_buckets};
use crate::server::interceptor::{LoggingSettings, MetricsRecorder, MetricsRegistry, REQUEST_ID_HEADER};
use crate::server::lifecycle::{BoundListener, Lifecycle};
use crate::server::listener::{InMemoryListener, ListenerMode};
use crate::server::registry::HttpRegistry;
use axum::Router;
use ferrule_core::call::{CallTable, Protocol};
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::id::IdGenerator;
use ferrule_core::state::ServerState;
use ferrule_core::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct HttpServerBuilder {
    registry: HttpRegistry,
    mode: ListenerMode,
    factory: Arc<dyn HttpServerFactory>,
    options: HttpServerOptions,
    tracing: Option<ExclusionRules>,
    logging: LoggingSettings,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl HttpServerBuilder {
    pub fn new(registry: HttpRegistry, mode: ListenerMode) -> Self {
        Self {
            registry,
            mode,
            factory: Arc::new(DefaultHttpServerFactory),
            options: HttpServerOptions::default(),
            tracing: None,
            logging: LoggingSettings::default(),
            metrics: None,
            ids: None,
        }
    }

    /// Builder configured from the `http` section. The request id header is
    /// always copied into call records.
    pub fn from_config(
        registry: HttpRegistry,
        app: &AppConfig,
        config: &HttpConfig,
        metrics: &MetricsRegistry,
    ) -> Self {
        let mode = ListenerMode::select(app.is_test(), config.addr, config.test_buffer_size);
        let base = LoggingSettings::new()
            .exclusions(ExclusionRules::prefixes(config.log.exclude.iter().cloned()))
            .level_from_outcome(config.log.level_from_response)
            .field(REQUEST_ID_HEADER, "request_id");
        let logging = config
            .log
            .fields
            .iter()
            .fold(base, |s, (header, field)| s.field(header, field));

        let mut builder = Self::new(registry, mode)
            .options(HttpServerOptions {
                debug: app.debug,
                obfuscate_errors: config.obfuscate_errors,
            })
            .logging(logging);
        if config.trace.enabled {
            builder = builder.tracing(ExclusionRules::prefixes(config.trace.exclude.iter().cloned()));
        }
        if config.metrics.enabled {
            let prefix = metric_prefix(&config.metrics.namespace, &config.metrics.subsystem);
            let buckets = parse_buckets(&config.metrics.buckets);
            builder = builder.metrics(metrics.register(
                Protocol::Http,
                &prefix,
                &buckets,
                config.metrics.normalize,
            ));
        }
        builder
    }

    pub fn factory(mut self, factory: Arc<dyn HttpServerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn options(mut self, options: HttpServerOptions) -> Self {
        self.options = options;
        self
    }

    /// URI prefixes listed in `exclusions` are served without spans.
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

    pub fn build(self) -> Result<HttpServer> {
        let resolved = self.registry.resolve()?;
        let base = self.factory.create(&self.options)?;

        let mut chain = ChainBuilder::new(Protocol::Http, CallTable::new())
            .debug(self.options.debug)
            .obfuscate_errors(self.options.obfuscate_errors)
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

        let routes = resolved.routes();
        for route in &routes {
            tracing::debug!(route = %route, "registering http handler");
        }
        let router = resolved.into_router(base, chain.layer())?;

        Ok(HttpServer {
            router,
            lifecycle: Lifecycle::new("http", self.mode),
            routes,
            concerns: chain.concerns().to_vec(),
        })
    }
}

/// A built HTTP server.
#[derive(Debug)]
pub struct HttpServer {
    router: Router,
    lifecycle: Lifecycle,
    routes: Vec<String>,
    concerns: Vec<Concern>,
}

impl HttpServer {
    /// The fully wrapped router, for in-process calls with
    /// `tower::ServiceExt::oneshot`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds the listener and serves in the background.
    pub async fn start(&self) -> Result<()> {
        let router = self.router.clone();
        self.lifecycle
            .start(move |bound, shutdown| async move {
                let served = match bound {
                    BoundListener::Tcp(listener) => {
                        axum::serve(listener, router)
                            .with_graceful_shutdown(shutdown)
                            .await
                    }
                    BoundListener::InMemory(acceptor) => {
                        axum::serve(acceptor, router)
                            .with_graceful_shutdown(shutdown)
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
            protocol: Protocol::Http,
            state: self.state(),
            listener: self.lifecycle.mode().kind(),
            address: self.local_addr().map(|a| a.to_string()),
            endpoints: self.routes.clone(),
            concerns: self.concerns.clone(),
            reflection: false,
            healthcheck: false,
        }
    }
}
