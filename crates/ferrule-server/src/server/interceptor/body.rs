//! Response body wrapper that reports a call's final outcome.
//!
//! A gRPC call is only finished once its trailers have been written, and a
//! streaming call may run long after the response head was returned. Every
//! concern that needs the final status wraps the response body in an
//! [`ObservedBody`] and gets called back exactly once, at end of stream, on
//! error, or when the body is dropped early.

use ferrule_core::call::Protocol;
use ferrule_core::outcome::{CallOutcome, grpc_code};
use http::{HeaderMap, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tonic::Code;

pub(crate) type OnComplete = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

/// Tracks the status a call has settled on and delivers it once.
///
/// Dropping a probe that has not fired reports the settled status if there
/// is one, `Internal` while unwinding from a panic, and `Cancelled`
/// otherwise.
pub(crate) struct Probe {
    protocol: Protocol,
    settled: Option<CallOutcome>,
    on_complete: Option<OnComplete>,
}

impl Probe {
    pub(crate) fn new<F>(protocol: Protocol, on_complete: F) -> Self
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        Self {
            protocol,
            settled: None,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// A probe that observes nothing, used by disabled or excluded concerns.
    pub(crate) fn inert(protocol: Protocol) -> Self {
        Self {
            protocol,
            settled: None,
            on_complete: None,
        }
    }

    /// Records what the response head says about the outcome.
    pub(crate) fn observe_head<B>(&mut self, response: &Response<B>) {
        match self.protocol {
            Protocol::Grpc => {
                // Trailers-only responses carry the status in the head.
                if let Some(code) = grpc_code(response.headers()) {
                    self.settled = Some(CallOutcome::Grpc(code));
                }
            }
            Protocol::Http => self.settled = Some(CallOutcome::Http(response.status())),
        }
    }

    fn observe_trailers(&mut self, trailers: &HeaderMap) {
        if self.protocol == Protocol::Grpc {
            if let Some(code) = grpc_code(trailers) {
                self.settled = Some(CallOutcome::Grpc(code));
            }
        }
    }

    pub(crate) fn finish(&mut self, outcome: CallOutcome) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(outcome);
        }
    }

    fn finish_at_end_of_stream(&mut self) {
        let outcome = self.settled.unwrap_or(match self.protocol {
            // A gRPC stream that ends without a status is malformed.
            Protocol::Grpc => CallOutcome::Grpc(Code::Unknown),
            Protocol::Http => CallOutcome::Http(StatusCode::OK),
        });
        self.finish(outcome);
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        if self.on_complete.is_none() {
            return;
        }
        let outcome = if std::thread::panicking() {
            CallOutcome::internal(self.protocol)
        } else {
            self.settled
                .unwrap_or_else(|| CallOutcome::cancelled(self.protocol))
        };
        self.finish(outcome);
    }
}

pin_project! {
    /// Response body that feeds a [`Probe`] while it is streamed.
    pub struct ObservedBody<B> {
        #[pin]
        inner: B,
        probe: Probe,
    }
}

impl<B> ObservedBody<B> {
    pub(crate) fn new(inner: B, probe: Probe) -> Self {
        Self { inner, probe }
    }
}

impl<B: Body> Body for ObservedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    this.probe.observe_trailers(trailers);
                }
            }
            Poll::Ready(Some(Err(_))) => {
                let outcome = CallOutcome::internal(this.probe.protocol);
                this.probe.finish(outcome);
            }
            Poll::Ready(None) => this.probe.finish_at_end_of_stream(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
