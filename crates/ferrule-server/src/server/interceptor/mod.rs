//! Call-wrapping concerns.
//!
//! Each concern is a tower [`Layer`](tower::Layer) over `http` requests and
//! responses, so a single layer covers unary calls and every streaming
//! shape. The layers are composed by [`chain`](crate::server::chain) in a
//! fixed order; none of them alters the call's result.

pub mod body;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod trace;

pub use body::ObservedBody;
pub use logging::{CALL_TARGET, LoggingLayer, LoggingService, LoggingSettings, REQUEST_ID_HEADER};
pub use metrics::{
    CallMetrics, CallSample, DEFAULT_BUCKETS, Exemplar, MetricsError, MetricsLayer,
    MetricsRecorder, MetricsRegistry, MetricsService,
};
pub use recovery::PanicResponder;
pub use trace::{TracingLayer, TracingService};

use axum::extract::MatchedPath;
use ferrule_core::call::{CallDescriptor, CallTable, Protocol};
use http::Request;
use opentelemetry::trace::TraceContextExt;
use std::sync::Arc;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Route of HTTP requests that matched no registered route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Returns the descriptor of the call carried by `request`.
///
/// The first concern to see a request resolves it and stores it in the
/// request extensions; the concerns further in reuse that instance.
pub(crate) fn describe<B>(
    protocol: Protocol,
    table: &CallTable,
    request: &mut Request<B>,
) -> Arc<CallDescriptor> {
    if let Some(call) = request.extensions().get::<Arc<CallDescriptor>>() {
        return Arc::clone(call);
    }
    let call = match protocol {
        Protocol::Grpc => table.resolve_grpc(request.uri().path()),
        Protocol::Http => {
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map_or(UNMATCHED_ROUTE, |matched| matched.as_str());
            Arc::new(CallDescriptor::http(request.method(), route))
        }
    };
    request.extensions_mut().insert(Arc::clone(&call));
    call
}

/// Name matched against exclusion rules: the full method for gRPC, the
/// request path for HTTP.
pub(crate) fn exclusion_key<'a, B>(call: &'a CallDescriptor, request: &'a Request<B>) -> &'a str {
    match call.protocol() {
        Protocol::Grpc => call.full_name(),
        Protocol::Http => request.uri().path(),
    }
}

/// Identifiers of the OpenTelemetry span backing a `tracing` span.
pub(crate) struct SpanIds {
    pub(crate) trace_id: String,
    pub(crate) span_id: String,
    pub(crate) sampled: bool,
}

impl SpanIds {
    /// `None` when the span is disabled or not bridged to OpenTelemetry.
    pub(crate) fn of(span: &tracing::Span) -> Option<Self> {
        let context = span.context();
        let span_ref = context.span();
        let span_context = span_ref.span_context();
        if !span_context.is_valid() {
            return None;
        }
        Some(Self {
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
            sampled: span_context.is_sampled(),
        })
    }
}
