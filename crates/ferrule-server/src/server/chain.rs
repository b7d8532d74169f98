//! Interceptor chain composition.
//!
//! The chain always runs Recovery, Tracing, Logging and Metrics in that
//! order. Configuration only decides which of Tracing and Metrics take part;
//! a disabled concern is a transparent layer, so it never shifts the others.
//!
//! ```
//! use ferrule_core::call::{CallTable, Protocol};
//! use ferrule_core::exclusion::ExclusionRules;
//! use ferrule_server::server::chain::{ChainBuilder, Concern};
//!
//! let chain = ChainBuilder::new(Protocol::Grpc, CallTable::new())
//!     .with_tracing(ExclusionRules::none())
//!     .build();
//! assert_eq!(
//!     chain.concerns(),
//!     &[Concern::Recovery, Concern::Tracing, Concern::Logging]
//! );
//! ```

use crate::server::interceptor::{
    LoggingLayer, LoggingService, LoggingSettings, MetricsLayer, MetricsRecorder, MetricsService,
    PanicResponder, TracingLayer, TracingService,
};
use ferrule_core::call::{CallTable, Protocol};
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::id::{IdGenerator, UuidV7Generator};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tower::{Layer, ServiceBuilder};
use tower_http::catch_panic::{CatchPanic, CatchPanicLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    Recovery,
    Tracing,
    Logging,
    Metrics,
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recovery => "recovery",
            Self::Tracing => "tracing",
            Self::Logging => "logging",
            Self::Metrics => "metrics",
        };
        f.write_str(name)
    }
}

pub struct ChainBuilder {
    protocol: Protocol,
    table: Arc<CallTable>,
    debug: bool,
    obfuscate_errors: bool,
    tracing: Option<ExclusionRules>,
    logging: LoggingSettings,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    ids: Arc<dyn IdGenerator>,
}

impl ChainBuilder {
    pub fn new(protocol: Protocol, table: CallTable) -> Self {
        Self {
            protocol,
            table: Arc::new(table),
            debug: false,
            obfuscate_errors: false,
            tracing: None,
            logging: LoggingSettings::default(),
            metrics: None,
            ids: Arc::new(UuidV7Generator),
        }
    }

    /// Debug mode exposes fault details in recovered error results.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn obfuscate_errors(mut self, obfuscate: bool) -> Self {
        self.obfuscate_errors = obfuscate;
        self
    }

    pub fn with_tracing(mut self, exclusions: ExclusionRules) -> Self {
        self.tracing = Some(exclusions);
        self
    }

    pub fn with_logging(mut self, settings: LoggingSettings) -> Self {
        self.logging = settings;
        self
    }

    pub fn with_metrics(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(recorder);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn build(self) -> InterceptorChain {
        let mut concerns = vec![Concern::Recovery];

        let tracing = match self.tracing {
            Some(exclusions) => {
                concerns.push(Concern::Tracing);
                TracingLayer::new(self.protocol, Arc::clone(&self.table), exclusions)
            }
            None => TracingLayer::disabled(),
        };

        concerns.push(Concern::Logging);
        let logging = LoggingLayer::new(self.protocol, Arc::clone(&self.table), self.logging)
            .with_id_generator(self.ids);

        let metrics = match self.metrics {
            Some(recorder) => {
                concerns.push(Concern::Metrics);
                MetricsLayer::new(self.protocol, Arc::clone(&self.table), recorder)
            }
            None => MetricsLayer::disabled(self.protocol),
        };

        let recovery = PanicResponder::new(self.protocol, self.debug)
            .obfuscated(self.obfuscate_errors)
            .into_layer();

        InterceptorChain {
            concerns,
            layer: InterceptorLayer {
                recovery,
                tracing,
                logging,
                metrics,
            },
        }
    }
}

/// The composed concerns of one server.
#[derive(Debug, Clone)]
pub struct InterceptorChain {
    concerns: Vec<Concern>,
    layer: InterceptorLayer,
}

impl InterceptorChain {
    /// Active concerns, outermost first.
    pub fn concerns(&self) -> &[Concern] {
        &self.concerns
    }

    pub fn layer(&self) -> InterceptorLayer {
        self.layer.clone()
    }
}

/// Single layer wrapping a service in every concern of the chain.
#[derive(Debug, Clone)]
pub struct InterceptorLayer {
    recovery: CatchPanicLayer<PanicResponder>,
    tracing: TracingLayer,
    logging: LoggingLayer,
    metrics: MetricsLayer,
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = CatchPanic<TracingService<LoggingService<MetricsService<S>>>, PanicResponder>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(self.recovery.clone())
            .layer(self.tracing.clone())
            .layer(self.logging.clone())
            .layer(self.metrics.clone())
            .service(inner)
    }
}
