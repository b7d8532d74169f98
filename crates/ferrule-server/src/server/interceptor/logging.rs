//! Call records.
//!
//! One structured event is emitted per call under the `ferrule::call`
//! target, once the final status is known. Calls matching the exclusion
//! rules are skipped only when they succeed: a failed call is always
//! logged.

use super::body::{ObservedBody, Probe};
use super::{SpanIds, describe, exclusion_key};
use ferrule_core::call::{CallDescriptor, CallTable, Protocol};
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::id::{IdGenerator, UuidV7Generator};
use ferrule_core::outcome::{CallOutcome, Severity};
use futures::FutureExt;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Request, Response};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::Span;

/// Correlation id header, read from requests and echoed on responses.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Target of every call record.
pub const CALL_TARGET: &str = "ferrule::call";

/// What the logging concern records and skips.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    exclusions: ExclusionRules,
    fields: Vec<(String, String)>,
    level_from_outcome: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            exclusions: ExclusionRules::none(),
            fields: Vec::new(),
            level_from_outcome: true,
        }
    }
}

impl LoggingSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusions(mut self, exclusions: ExclusionRules) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Copies request metadata `key` into the record as `field`.
    pub fn field(mut self, key: impl Into<String>, field: impl Into<String>) -> Self {
        let key = key.into().to_ascii_lowercase();
        let field = field.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = field,
            None => self.fields.push((key, field)),
        }
        self
    }

    /// When disabled every record is emitted at `INFO`.
    pub fn level_from_outcome(mut self, enabled: bool) -> Self {
        self.level_from_outcome = enabled;
        self
    }

    pub fn exclusion_rules(&self) -> &ExclusionRules {
        &self.exclusions
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

#[derive(Clone)]
pub struct LoggingLayer {
    protocol: Protocol,
    table: Arc<CallTable>,
    settings: Arc<LoggingSettings>,
    ids: Arc<dyn IdGenerator>,
}

impl LoggingLayer {
    pub fn new(protocol: Protocol, table: Arc<CallTable>, settings: LoggingSettings) -> Self {
        Self {
            protocol,
            table,
            settings: Arc::new(settings),
            ids: Arc::new(UuidV7Generator),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

impl fmt::Debug for LoggingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingLayer")
            .field("protocol", &self.protocol)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
    layer: LoggingLayer,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoggingService<S>
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
        let layer = &self.layer;
        let protocol = layer.protocol;
        let call = describe(protocol, &layer.table, &mut request);
        let excluded = layer
            .settings
            .exclusions
            .is_excluded(exclusion_key(&call, &request));
        let request_id = correlation_id(request.headers_mut(), layer.ids.as_ref());
        let fields = LogFields::extract(&layer.settings.fields, request.headers());

        // Events are parented explicitly: the body may finish on a task
        // where the call's span is not entered.
        let span = Span::current();
        let trace_id = SpanIds::of(&span).map(|ids| ids.trace_id);

        let record = CallRecord {
            call,
            request_id: request_id.clone(),
            fields,
            trace_id,
            excluded,
            level_from_outcome: layer.settings.level_from_outcome,
            started: Instant::now(),
            span,
        };
        let mut probe = Probe::new(protocol, move |outcome| record.emit(outcome));
        let future = self.inner.call(request);

        Box::pin(async move {
            let mut response = match AssertUnwindSafe(future).catch_unwind().await {
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
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .entry(REQUEST_ID_HEADER)
                    .or_insert(value);
            }
            probe.observe_head(&response);
            Ok(response.map(|body| ObservedBody::new(body, probe)))
        })
    }
}

/// Reuses the caller's correlation id or generates one and stores it on the
/// request so handlers can read it.
fn correlation_id(headers: &mut HeaderMap, ids: &dyn IdGenerator) -> String {
    let existing = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(id) = existing {
        return id.to_owned();
    }

    let id = ids.generate();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    id
}

/// Extra record fields copied from request metadata.
#[derive(Debug, Default)]
struct LogFields(Vec<(String, String)>);

impl LogFields {
    fn extract(mapping: &[(String, String)], headers: &HeaderMap) -> Self {
        let fields = mapping
            .iter()
            .filter_map(|(key, field)| {
                let value = headers.get(key.as_str())?.to_str().ok()?;
                Some((field.clone(), value.to_owned()))
            })
            .collect();
        Self(fields)
    }
}

impl fmt::Display for LogFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{field}={value}")?;
        }
        Ok(())
    }
}

struct CallRecord {
    call: Arc<CallDescriptor>,
    request_id: String,
    fields: LogFields,
    trace_id: Option<String>,
    excluded: bool,
    level_from_outcome: bool,
    started: Instant,
    span: Span,
}

macro_rules! call_event {
    ($level:expr, $record:expr, $outcome:expr, $latency_ms:expr, $message:expr) => {
        tracing::event!(
            target: CALL_TARGET,
            parent: &$record.span,
            $level,
            system = $record.call.protocol().as_str(),
            request_id = %$record.request_id,
            method = %$record.call.full_name(),
            kind = $record.call.kind().as_str(),
            code = %$outcome.label(),
            latency_ms = $latency_ms,
            trace_id = $record.trace_id.as_deref().unwrap_or(""),
            fields = %$record.fields,
            "{}",
            $message
        )
    };
}

impl CallRecord {
    fn emit(self, outcome: CallOutcome) {
        if self.excluded && outcome.is_success() {
            return;
        }
        let latency_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        let message = if outcome.is_success() {
            "call succeeded"
        } else {
            "call failed"
        };
        let severity = if self.level_from_outcome {
            outcome.severity()
        } else {
            Severity::Info
        };
        match severity {
            Severity::Info => call_event!(tracing::Level::INFO, self, outcome, latency_ms, message),
            Severity::Warn => call_event!(tracing::Level::WARN, self, outcome, latency_ms, message),
            Severity::Error => {
                call_event!(tracing::Level::ERROR, self, outcome, latency_ms, message)
            }
        }
    }
}
