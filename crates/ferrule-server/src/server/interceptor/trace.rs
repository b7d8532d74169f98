//! Server spans.
//!
//! A span is opened per call, named after the call descriptor and parented
//! to the W3C trace context found in the request headers. The inner service
//! is called and polled inside the span so the trace context reaches the
//! handler. Excluded calls are served without a span.

use super::body::{ObservedBody, Probe};
use super::{describe, exclusion_key};
use ferrule_core::call::{CallDescriptor, CallTable, Protocol};
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::outcome::{CallOutcome, Severity};
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{HeaderMap, Request, Response};
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TraceContextExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::field::Empty;
use tracing::{Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Debug)]
struct TraceSettings {
    protocol: Protocol,
    table: Arc<CallTable>,
    exclusions: ExclusionRules,
}

#[derive(Debug, Clone)]
pub struct TracingLayer {
    settings: Option<Arc<TraceSettings>>,
}

impl TracingLayer {
    pub fn new(protocol: Protocol, table: Arc<CallTable>, exclusions: ExclusionRules) -> Self {
        Self {
            settings: Some(Arc::new(TraceSettings {
                protocol,
                table,
                exclusions,
            })),
        }
    }

    /// A layer that passes every call through untouched.
    pub fn disabled() -> Self {
        Self { settings: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            settings: self.settings.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingService<S> {
    inner: S,
    settings: Option<Arc<TraceSettings>>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
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
        let Some(settings) = self.settings.as_deref() else {
            return passthrough(self.inner.call(request), Protocol::Grpc);
        };
        let protocol = settings.protocol;
        let call = describe(protocol, &settings.table, &mut request);
        if settings
            .exclusions
            .is_excluded(exclusion_key(&call, &request))
        {
            return passthrough(self.inner.call(request), protocol);
        }

        let span = server_span(&call, &request);
        let mut probe = Probe::new(protocol, {
            let span = span.clone();
            move |outcome| record_outcome(&span, outcome)
        });
        let future = span.in_scope(|| self.inner.call(request));

        Box::pin(
            async move {
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
            }
            .instrument(span),
        )
    }
}

fn passthrough<F, B, E>(future: F, protocol: Protocol) -> BoxFuture<'static, Result<Response<ObservedBody<B>>, E>>
where
    F: Future<Output = Result<Response<B>, E>> + Send + 'static,
{
    Box::pin(async move {
        let response = future.await?;
        Ok(response.map(|body| ObservedBody::new(body, Probe::inert(protocol))))
    })
}

fn server_span<B>(call: &CallDescriptor, request: &Request<B>) -> Span {
    let span = match call.protocol() {
        Protocol::Grpc => tracing::info_span!(
            "grpc.server",
            otel.name = %call.full_name().trim_start_matches('/'),
            otel.kind = "server",
            otel.status_code = Empty,
            rpc.system = "grpc",
            rpc.service = %call.service(),
            rpc.method = %call.method(),
            rpc.call_kind = call.kind().as_str(),
            rpc.grpc.status_code = Empty,
        ),
        Protocol::Http => tracing::info_span!(
            "http.server",
            otel.name = %call.full_name(),
            otel.kind = "server",
            otel.status_code = Empty,
            http.request.method = %call.method(),
            http.route = %call.service(),
            url.path = %request.uri().path(),
            http.response.status_code = Empty,
        ),
    };

    let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    if parent.span().span_context().is_valid() {
        let _ = span.set_parent(parent);
    }
    span
}

fn record_outcome(span: &Span, outcome: CallOutcome) {
    match outcome {
        CallOutcome::Grpc(code) => {
            span.record("rpc.grpc.status_code", code as i64);
        }
        CallOutcome::Http(status) => {
            span.record("http.response.status_code", status.as_u16());
        }
    }
    let status = if outcome.severity() == Severity::Error {
        "ERROR"
    } else {
        "OK"
    };
    span.record("otel.status_code", status);
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}
