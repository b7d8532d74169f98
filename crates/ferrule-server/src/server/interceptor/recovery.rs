//! Panic recovery.
//!
//! Recovery is the outermost concern and is never excluded. It is built on
//! `tower_http`'s `CatchPanic`; this module only decides what the caller
//! gets back and makes sure the fault is logged.
//!
//! In debug mode a panic hook records the stack of the panicking thread, so
//! the log record and the HTTP payload show where the panic happened rather
//! than where it was caught.

use bytes::Bytes;
use ferrule_core::call::Protocol;
use http::{HeaderValue, Response, StatusCode, header};
use http_body_util::Full;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::sync::Once;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};

thread_local! {
    static PANIC_STACK: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

static STACK_HOOK: Once = Once::new();

/// Chains a hook in front of the current one that keeps the stack of the
/// last panic on each thread.
fn record_panic_stacks() {
    STACK_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_STACK.with(|slot| slot.set(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

/// `CatchPanic` recovers on the thread that panicked.
fn take_panic_stack() -> Option<String> {
    PANIC_STACK
        .with(Cell::take)
        .map(|stack| stack.to_string())
}

/// Message returned when fault details must not leak to the caller.
pub const GENERIC_INTERNAL_MESSAGE: &str = "internal server error";

/// Turns a caught panic into an `Internal` gRPC status or a JSON `500`.
#[derive(Debug, Clone, Copy)]
pub struct PanicResponder {
    protocol: Protocol,
    expose_details: bool,
}

impl PanicResponder {
    /// Fault details are only returned to the caller in debug mode.
    pub fn new(protocol: Protocol, debug: bool) -> Self {
        if debug {
            record_panic_stacks();
        }
        Self {
            protocol,
            expose_details: debug,
        }
    }

    /// Never return fault details, whatever the debug flag says.
    pub fn obfuscated(mut self, obfuscate: bool) -> Self {
        self.expose_details &= !obfuscate;
        self
    }

    pub fn into_layer(self) -> CatchPanicLayer<Self> {
        CatchPanicLayer::custom(self)
    }

    fn message(&self, details: &str) -> String {
        if self.expose_details {
            format!("panic: {details}")
        } else {
            GENERIC_INTERNAL_MESSAGE.to_owned()
        }
    }
}

impl ResponseForPanic for PanicResponder {
    type ResponseBody = Full<Bytes>;

    fn response_for_panic(
        &mut self,
        err: Box<dyn Any + Send + 'static>,
    ) -> Response<Self::ResponseBody> {
        let details = panic_message(err.as_ref());
        let stack = take_panic_stack();
        tracing::error!(
            target: "ferrule::recovery",
            system = self.protocol.as_str(),
            panic = %details,
            stack = stack.as_deref(),
            "recovered from panic in handler"
        );

        let message = self.message(&details);
        match self.protocol {
            // The stack stays out of grpc-message, which travels in a header.
            Protocol::Grpc => tonic::Status::internal(message).into_http(),
            Protocol::Http => {
                let payload = match stack.filter(|_| self.expose_details) {
                    Some(stack) => serde_json::json!({ "message": message, "stack": stack }),
                    None => serde_json::json!({ "message": message }),
                };
                let mut response = Response::new(Full::from(payload.to_string()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
        }
    }
}

fn panic_message(err: &(dyn Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
