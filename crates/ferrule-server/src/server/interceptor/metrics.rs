//! Call metrics.
//!
//! Every call increments a counter and records its duration in a histogram,
//! labelled by method and final status. Calls that belong to a sampled trace
//! attach its ids to both observations as an OpenMetrics exemplar.
//! Instruments are registered once per prefix through [`MetricsRegistry`];
//! the layer itself only talks to a [`MetricsRecorder`], whose failures are
//! logged and dropped.

use super::body::{ObservedBody, Probe};
use super::{SpanIds, describe};
use ferrule_core::call::{CallDescriptor, CallTable, Protocol};
use ferrule_core::outcome::CallOutcome;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{Request, Response};
use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::exemplar::{CounterWithExemplar, HistogramWithExemplars};
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::Span;

/// Histogram boundaries, in seconds, used when none are configured.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Parses a comma separated bucket list. Unparsable entries are skipped and
/// an empty result falls back to [`DEFAULT_BUCKETS`].
pub fn parse_buckets(raw: &str) -> Vec<f64> {
    let mut buckets: Vec<f64> = raw
        .split(',')
        .filter_map(|entry| entry.trim().parse::<f64>().ok())
        .filter(|bucket| bucket.is_finite())
        .collect();
    if buckets.is_empty() {
        return DEFAULT_BUCKETS.to_vec();
    }
    buckets.sort_by(f64::total_cmp);
    buckets.dedup();
    buckets
}

/// Joins namespace and subsystem into a metric name prefix, replacing every
/// character a metric name cannot hold with `_`.
pub fn metric_prefix(namespace: &str, subsystem: &str) -> String {
    let joined = match (namespace.is_empty(), subsystem.is_empty()) {
        (false, false) => format!("{namespace}_{subsystem}"),
        (false, true) => namespace.to_owned(),
        (true, _) => subsystem.to_owned(),
    };
    joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] fmt::Error),
}

/// Trace reference attached to a metric observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exemplar {
    trace_id: String,
    span_id: String,
}

impl Exemplar {
    /// Only calls that are part of a sampled trace carry an exemplar.
    pub fn from_span(span: &Span) -> Option<Self> {
        let ids = SpanIds::of(span)?;
        ids.sampled.then_some(Self {
            trace_id: ids.trace_id,
            span_id: ids.span_id,
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    fn labels(&self) -> TraceLabels {
        TraceLabels {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }
}

/// One finished call, as seen by a recorder.
#[derive(Debug)]
pub struct CallSample<'a> {
    pub call: &'a CallDescriptor,
    pub outcome: CallOutcome,
    pub duration: Duration,
    pub exemplar: Option<&'a Exemplar>,
}

pub trait MetricsRecorder: Send + Sync + 'static {
    fn record(&self, sample: &CallSample<'_>) -> Result<(), MetricsError>;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TraceLabels {
    trace_id: String,
    span_id: String,
}

type CallLabels = Vec<(&'static str, String)>;

#[derive(Clone, Debug)]
struct Buckets(Arc<[f64]>);

impl MetricConstructor<HistogramWithExemplars<TraceLabels>> for Buckets {
    fn new_metric(&self) -> HistogramWithExemplars<TraceLabels> {
        HistogramWithExemplars::new(self.0.iter().copied())
    }
}

type CallCounter = Family<CallLabels, CounterWithExemplar<TraceLabels>>;
type CallHistogram = Family<CallLabels, HistogramWithExemplars<TraceLabels>, Buckets>;

/// Call counter and duration histogram living in a [`MetricsRegistry`].
pub struct CallMetrics {
    protocol: Protocol,
    calls: CallCounter,
    durations: CallHistogram,
    normalize_status: bool,
}

impl CallMetrics {
    fn register(
        registry: &mut Registry,
        protocol: Protocol,
        prefix: &str,
        buckets: &[f64],
        normalize_status: bool,
    ) -> Self {
        let calls = CallCounter::default();
        let durations = CallHistogram::new_with_constructor(Buckets(buckets.into()));
        // Counter names get their `_total` suffix at encoding.
        match protocol {
            Protocol::Grpc => {
                registry.register(
                    format!("{prefix}_grpc_server_handled"),
                    "Total number of RPCs completed on the server",
                    calls.clone(),
                );
                registry.register(
                    format!("{prefix}_grpc_server_handling_seconds"),
                    "Duration of RPCs handled by the server",
                    durations.clone(),
                );
            }
            Protocol::Http => {
                registry.register(
                    format!("{prefix}_http_server_requests"),
                    "Number of processed HTTP requests",
                    calls.clone(),
                );
                registry.register(
                    format!("{prefix}_http_server_requests_duration_seconds"),
                    "Time spent processing HTTP requests",
                    durations.clone(),
                );
            }
        }
        Self {
            protocol,
            calls,
            durations,
            normalize_status,
        }
    }

    fn labels(&self, sample: &CallSample<'_>) -> CallLabels {
        let call = sample.call;
        match self.protocol {
            Protocol::Grpc => vec![
                ("grpc_type", call.kind().as_str().to_owned()),
                ("grpc_service", call.service().to_owned()),
                ("grpc_method", call.method().to_owned()),
                ("grpc_code", sample.outcome.label().into_owned()),
            ],
            Protocol::Http => {
                let status = if self.normalize_status {
                    sample.outcome.normalized_label()
                } else {
                    sample.outcome.label()
                };
                vec![
                    ("method", call.method().to_owned()),
                    ("path", call.service().to_owned()),
                    ("status", status.into_owned()),
                ]
            }
        }
    }
}

impl MetricsRecorder for CallMetrics {
    fn record(&self, sample: &CallSample<'_>) -> Result<(), MetricsError> {
        let labels = self.labels(sample);
        let exemplar = sample.exemplar.map(Exemplar::labels);
        self.calls.get_or_create(&labels).inc_by(1, exemplar.clone());
        self.durations
            .get_or_create(&labels)
            .observe(sample.duration.as_secs_f64(), exemplar);
        Ok(())
    }
}

impl fmt::Debug for CallMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMetrics")
            .field("protocol", &self.protocol)
            .field("normalize_status", &self.normalize_status)
            .finish_non_exhaustive()
    }
}

/// Registers call instruments exactly once per prefix and protocol, however
/// many servers are built from it, and renders them for scraping.
#[derive(Default)]
pub struct MetricsRegistry {
    registry: Mutex<Registry>,
    registered: Mutex<HashMap<String, Arc<CallMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        protocol: Protocol,
        prefix: &str,
        buckets: &[f64],
        normalize_status: bool,
    ) -> Arc<CallMetrics> {
        let key = format!("{}:{prefix}", protocol.as_str());
        let mut registered = self.registered.lock();
        let metrics = registered.entry(key).or_insert_with(|| {
            tracing::debug!(
                system = protocol.as_str(),
                prefix,
                "registering call metrics"
            );
            Arc::new(CallMetrics::register(
                &mut self.registry.lock(),
                protocol,
                prefix,
                buckets,
                normalize_status,
            ))
        });
        Arc::clone(metrics)
    }

    /// Every registered series in the OpenMetrics text format, exemplars
    /// included.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry.lock())?;
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("registered", &self.registered.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct MetricsLayer {
    protocol: Protocol,
    table: Arc<CallTable>,
    recorder: Option<Arc<dyn MetricsRecorder>>,
}

impl MetricsLayer {
    pub fn new(protocol: Protocol, table: Arc<CallTable>, recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            protocol,
            table,
            recorder: Some(recorder),
        }
    }

    pub fn disabled(protocol: Protocol) -> Self {
        Self {
            protocol,
            table: Arc::default(),
            recorder: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.recorder.is_some()
    }
}

impl fmt::Debug for MetricsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsLayer")
            .field("protocol", &self.protocol)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    layer: MetricsLayer,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let protocol = self.layer.protocol;
        let mut probe = match &self.layer.recorder {
            Some(recorder) => {
                let call = describe(protocol, &self.layer.table, &mut request);
                let exemplar = Exemplar::from_span(&Span::current());
                let recorder = Arc::clone(recorder);
                let started = Instant::now();
                Probe::new(protocol, move |outcome| {
                    let sample = CallSample {
                        call: &call,
                        outcome,
                        duration: started.elapsed(),
                        exemplar: exemplar.as_ref(),
                    };
                    if let Err(error) = recorder.record(&sample) {
                        tracing::debug!(%error, method = %call, "dropping call metrics");
                    }
                })
            }
            None => Probe::inert(protocol),
        };
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    probe.finish(CallOutcome::internal(protocol));
                    return Err(err);
                }
                Err(panic) => {
                    probe.finish(CallOutcome::internal(protocol));
                    std::panic::resume_unwind(panic);
                }
            };
            probe.observe_head(&response);
            Ok(response.map(|body| ObservedBody::new(body, probe)))
        })
    }
}
