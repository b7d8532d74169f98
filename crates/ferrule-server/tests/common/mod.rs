#![allow(dead_code)]

use ferrule_server::server::health::{CheckResult, HealthChecker, ProbeKind};
use ferrule_server::server::interceptor::CALL_TARGET;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};

/// A call record as emitted on the `ferrule::call` target.
#[derive(Debug, Clone)]
pub struct CallLog {
    pub level: Level,
    pub fields: HashMap<String, String>,
}

impl CallLog {
    pub fn method(&self) -> &str {
        self.fields.get("method").map(String::as_str).unwrap_or("")
    }

    pub fn code(&self) -> &str {
        self.fields.get("code").map(String::as_str).unwrap_or("")
    }
}

/// Collects call records. Install with [`CallLogs::set_default`] on a
/// current-thread runtime so the server tasks report to it too.
#[derive(Clone, Default)]
pub struct CallLogs(Arc<Mutex<Vec<CallLog>>>);

impl CallLogs {
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn for_method(&self, method: &str) -> Vec<CallLog> {
        self.0
            .lock()
            .iter()
            .filter(|log| log.method() == method)
            .cloned()
            .collect()
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for CallLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != CALL_TARGET {
            return;
        }
        let mut visitor = Fields::default();
        event.record(&mut visitor);
        self.0.lock().push(CallLog {
            level: *event.metadata().level(),
            fields: visitor.0,
        });
    }
}

#[derive(Default)]
struct Fields(HashMap<String, String>);

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

/// Fails the liveness probe, passes the others.
pub struct DeadLiveness;

impl HealthChecker for DeadLiveness {
    fn check(&self, kind: ProbeKind) -> BoxFuture<'_, CheckResult> {
        Box::pin(async move {
            match kind {
                ProbeKind::Liveness => CheckResult::unhealthy("heartbeat", "stalled"),
                _ => CheckResult::healthy(),
            }
        })
    }
}

/// Panics on the liveness probe, passes the others.
pub struct ExplodingLiveness;

impl HealthChecker for ExplodingLiveness {
    fn check(&self, kind: ProbeKind) -> BoxFuture<'_, CheckResult> {
        Box::pin(async move {
            if kind == ProbeKind::Liveness {
                panic!("probe exploded");
            }
            CheckResult::healthy()
        })
    }
}
