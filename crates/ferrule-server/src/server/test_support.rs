//! Helpers shared by the unit tests of the server modules.

use crate::server::interceptor::{CallSample, MetricsError, MetricsRecorder};
use bytes::Bytes;
use ferrule_core::call::CallKind;
use ferrule_core::outcome::{CallOutcome, GRPC_STATUS_HEADER};
use http::{HeaderMap, HeaderValue, Request, Response, header};
use http_body::Frame;
use http_body_util::{Full, StreamBody};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;
use tower::Service;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;

pub(crate) type TestRequestBody = Full<Bytes>;

pub(crate) type TestBody =
    StreamBody<futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, Infallible>>>>;

pub(crate) fn grpc_request(path: &str) -> Request<TestRequestBody> {
    Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// A streamed response: one data frame per message, then the status trailers.
pub(crate) fn grpc_response(messages: &[&str], code: Code) -> Response<TestBody> {
    let mut frames: Vec<Result<Frame<Bytes>, Infallible>> = messages
        .iter()
        .map(|m| Ok(Frame::data(Bytes::copy_from_slice(m.as_bytes()))))
        .collect();
    let mut trailers = HeaderMap::new();
    trailers.insert(GRPC_STATUS_HEADER, HeaderValue::from(code as i32));
    frames.push(Ok(Frame::trailers(trailers)));

    Response::builder()
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(StreamBody::new(futures::stream::iter(frames)))
        .unwrap()
}

/// A response whose status travels in the head, with an empty body.
pub(crate) fn grpc_trailers_only(code: Code) -> Response<TestBody> {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/grpc")
        .header(GRPC_STATUS_HEADER, HeaderValue::from(code as i32))
        .body(StreamBody::new(futures::stream::iter(Vec::new())))
        .unwrap()
}

pub(crate) fn grpc_handler(
    code: Code,
) -> impl Service<
    Request<TestRequestBody>,
    Response = Response<TestBody>,
    Error = Infallible,
    Future: Send + 'static,
> + Clone
+ Send
+ Sync
+ 'static {
    tower::service_fn(move |_request: Request<TestRequestBody>| async move {
        Ok::<_, Infallible>(grpc_response(&["reply"], code))
    })
}

pub(crate) fn panicking_handler(
    message: &'static str,
) -> impl Service<
    Request<TestRequestBody>,
    Response = Response<TestBody>,
    Error = Infallible,
    Future: Send + 'static,
> + Clone
+ Send
+ Sync
+ 'static {
    tower::service_fn(move |_request: Request<TestRequestBody>| async move {
        if !message.is_empty() {
            panic!("{message}");
        }
        Ok::<_, Infallible>(grpc_response(&[], Code::Ok))
    })
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedSample {
    pub(crate) method: String,
    pub(crate) kind: CallKind,
    pub(crate) outcome: CallOutcome,
    pub(crate) duration: Duration,
    pub(crate) exemplar: bool,
}

/// Recorder keeping every sample in memory, optionally failing each one.
#[derive(Debug, Default)]
pub(crate) struct FakeRecorder {
    samples: Mutex<Vec<RecordedSample>>,
    fail: bool,
}

impl FakeRecorder {
    pub(crate) fn failing() -> Self {
        Self {
            samples: Mutex::default(),
            fail: true,
        }
    }

    pub(crate) fn samples(&self) -> Vec<RecordedSample> {
        self.samples.lock().clone()
    }
}

impl MetricsRecorder for FakeRecorder {
    fn record(&self, sample: &CallSample<'_>) -> Result<(), MetricsError> {
        self.samples.lock().push(RecordedSample {
            method: sample.call.method().to_owned(),
            kind: sample.call.kind(),
            outcome: sample.outcome,
            duration: sample.duration,
            exemplar: sample.exemplar.is_some(),
        });
        if self.fail {
            return Err(MetricsError::Unavailable("collector offline".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SpanRecord {
    pub(crate) name: &'static str,
    fields: HashMap<String, String>,
}

impl SpanRecord {
    pub(crate) fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub(crate) target: String,
    pub(crate) level: Level,
    pub(crate) span: Option<String>,
    fields: HashMap<String, String>,
}

impl EventRecord {
    pub(crate) fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }
}

#[derive(Default)]
struct Captured {
    spans: Vec<SpanRecord>,
    events: Vec<EventRecord>,
}

struct SpanSlot(usize);

/// `tracing` layer recording spans and events for assertions.
#[derive(Clone, Default)]
pub(crate) struct Capture {
    inner: Arc<Mutex<Captured>>,
}

impl Capture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs the capture as this thread's subscriber.
    pub(crate) fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub(crate) fn spans(&self) -> Vec<SpanRecord> {
        self.inner.lock().spans.clone()
    }

    pub(crate) fn events_for(&self, target: &str) -> Vec<EventRecord> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect()
    }
}

impl<S> tracing_subscriber::Layer<S> for Capture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        let mut captured = self.inner.lock();
        captured.spans.push(SpanRecord {
            name: attrs.metadata().name(),
            fields: visitor.0,
        });
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanSlot(captured.spans.len() - 1));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let extensions = span.extensions();
        let Some(SpanSlot(slot)) = extensions.get::<SpanSlot>() else {
            return;
        };
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if let Some(record) = self.inner.lock().spans.get_mut(*slot) {
            record.fields.extend(visitor.0);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let span = ctx.event_span(event).map(|s| s.name().to_owned());
        self.inner.lock().events.push(EventRecord {
            target: event.metadata().target().to_owned(),
            level: *event.metadata().level(),
            span,
            fields: visitor.0,
        });
    }
}

#[derive(Default)]
struct FieldVisitor(HashMap<String, String>);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_owned(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_owned(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}
