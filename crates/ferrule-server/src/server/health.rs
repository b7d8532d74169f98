//! `grpc.health.v1.Health` backed by an external checker.
//!
//! The probe being asked for is read from the requested service name:
//! anything containing `liveness` or `readiness` selects that probe, every
//! other name (including the empty one) selects the startup probe.

use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::Health;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Startup,
    Readiness,
    Liveness,
}

impl ProbeKind {
    pub fn from_service_name(service: &str) -> Self {
        let service = service.to_ascii_lowercase();
        if service.contains("liveness") {
            Self::Liveness
        } else if service.contains("readiness") {
            Self::Readiness
        } else {
            Self::Startup
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Readiness => "readiness",
            Self::Liveness => "liveness",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated result of one probe evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub success: bool,
    /// Probe name → failure reason, for the probes that failed.
    pub failures: Vec<(String, String)>,
}

impl CheckResult {
    pub fn healthy() -> Self {
        Self {
            success: true,
            failures: Vec::new(),
        }
    }

    pub fn unhealthy(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            failures: vec![(probe.into(), reason.into())],
        }
    }
}

/// Evaluates the probes registered for a [`ProbeKind`].
pub trait HealthChecker: Send + Sync + 'static {
    fn check(&self, kind: ProbeKind) -> BoxFuture<'_, CheckResult>;
}

/// Checker with no probes registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

impl HealthChecker for AlwaysHealthy {
    fn check(&self, _kind: ProbeKind) -> BoxFuture<'_, CheckResult> {
        Box::pin(async { CheckResult::healthy() })
    }
}

#[derive(Clone)]
pub struct HealthService {
    checker: Arc<dyn HealthChecker>,
}

impl HealthService {
    pub fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self { checker }
    }
}

impl fmt::Debug for HealthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthService").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        let kind = ProbeKind::from_service_name(&service);
        let result = self.checker.check(kind).await;

        let status = if result.success {
            tracing::debug!(%kind, service = %service, "health check succeeded");
            ServingStatus::Serving
        } else {
            tracing::warn!(
                %kind,
                service = %service,
                failures = ?result.failures,
                "health check failed"
            );
            ServingStatus::NotServing
        };

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }

    type WatchStream = futures::stream::Empty<Result<HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not supported"))
    }
}
