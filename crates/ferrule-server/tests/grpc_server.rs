mod common;

use common::{CallLogs, DeadLiveness, ExplodingLiveness};
use ferrule_core::Error;
use ferrule_core::call::ServiceDescriptor;
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::state::ServerState;
use ferrule_server::server::chain::Concern;
use ferrule_server::server::health::{AlwaysHealthy, CheckResult, HealthChecker, HealthService, ProbeKind};
use ferrule_server::server::interceptor::LoggingSettings;
use ferrule_server::server::listener::{InMemoryListener, ListenerKind, ListenerMode};
use ferrule_server::server::registry::GrpcRegistry;
use ferrule_server::server::{GrpcServer, GrpcServerBuilder};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::health_server::HealthServer;
use tonic_health::pb::HealthCheckRequest;

const CHECK: &str = "/grpc.health.v1.Health/Check";

fn in_memory() -> ListenerMode {
    ListenerMode::InMemory(InMemoryListener::default())
}

fn local() -> ListenerMode {
    ListenerMode::Network {
        addr: "127.0.0.1:0".parse().unwrap(),
    }
}

async fn in_memory_client(server: &GrpcServer) -> HealthClient<Channel> {
    let listener = server.in_memory_listener().expect("test mode server");
    let channel = Endpoint::from_static("http://in-memory")
        .connect_with_connector(listener.connector())
        .await
        .unwrap();
    HealthClient::new(channel)
}

async fn network_client(server: &GrpcServer) -> HealthClient<Channel> {
    let addr = server.local_addr().expect("bound address");
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    HealthClient::new(channel)
}

async fn probe(client: &mut HealthClient<Channel>, service: &str) -> Result<i32, tonic::Status> {
    client
        .check(HealthCheckRequest {
            service: service.to_owned(),
        })
        .await
        .map(|response| response.into_inner().status)
}

#[tokio::test]
async fn health_probes_over_the_in_memory_listener() {
    let server = GrpcServerBuilder::new(GrpcRegistry::new(), in_memory())
        .healthcheck(Arc::new(DeadLiveness))
        .build()
        .unwrap();
    server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Serving);
    assert_eq!(server.local_addr(), None);

    let mut client = in_memory_client(&server).await;
    assert_eq!(probe(&mut client, "").await.unwrap(), ServingStatus::Serving as i32);
    assert_eq!(
        probe(&mut client, "app-readiness").await.unwrap(),
        ServingStatus::Serving as i32
    );
    assert_eq!(
        probe(&mut client, "app-liveness").await.unwrap(),
        ServingStatus::NotServing as i32
    );

    server.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn info_describes_the_built_server() {
    let server = GrpcServerBuilder::new(GrpcRegistry::new(), in_memory())
        .healthcheck(Arc::new(AlwaysHealthy))
        .tracing(ExclusionRules::none())
        .build()
        .unwrap();

    let info = server.info();
    assert_eq!(info.listener, ListenerKind::InMemory);
    assert_eq!(info.endpoints, vec!["grpc.health.v1.Health".to_owned()]);
    assert_eq!(
        info.concerns,
        vec![Concern::Recovery, Concern::Tracing, Concern::Logging]
    );
    assert!(info.healthcheck);
    assert!(!info.reflection);
    assert_eq!(info.to_json()["state"], "not_started");
}

#[tokio::test]
async fn panics_are_recovered_and_the_server_keeps_serving() {
    for (debug, exposed) in [(true, true), (false, false)] {
        let server = GrpcServerBuilder::new(GrpcRegistry::new(), in_memory())
            .healthcheck(Arc::new(ExplodingLiveness))
            .debug(debug)
            .build()
            .unwrap();
        server.start().await.unwrap();
        let mut client = in_memory_client(&server).await;

        let status = probe(&mut client, "liveness").await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message().contains("probe exploded"), exposed);

        assert_eq!(
            probe(&mut client, "startup").await.unwrap(),
            ServingStatus::Serving as i32
        );
        server.stop(Duration::from_secs(1)).await.unwrap();
    }
}

#[tokio::test]
async fn excluded_calls_are_logged_only_when_they_fail() {
    let logs = CallLogs::default();
    let _guard = logs.set_default();

    let server = GrpcServerBuilder::new(GrpcRegistry::new(), in_memory())
        .healthcheck(Arc::new(ExplodingLiveness))
        .logging(LoggingSettings::new().exclusions(ExclusionRules::exact([CHECK])))
        .build()
        .unwrap();
    server.start().await.unwrap();
    let mut client = in_memory_client(&server).await;

    probe(&mut client, "readiness").await.unwrap();
    assert!(logs.for_method(CHECK).is_empty());

    probe(&mut client, "liveness").await.unwrap_err();
    let records = logs.for_method(CHECK);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code(), "Internal");
    assert_eq!(records[0].level, tracing::Level::ERROR);

    server.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn registered_services_are_served_with_their_call_kinds() {
    let logs = CallLogs::default();
    let _guard = logs.set_default();

    let mut registry = GrpcRegistry::new();
    registry.register(
        ServiceDescriptor::new("grpc.health.v1.Health")
            .unary("Check")
            .server_streaming("Watch"),
        HealthServer::new(HealthService::new(Arc::new(AlwaysHealthy))),
    );
    let server = GrpcServerBuilder::new(registry, in_memory()).build().unwrap();
    server.start().await.unwrap();
    let mut client = in_memory_client(&server).await;

    let status = client
        .watch(HealthCheckRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let records = logs.for_method("/grpc.health.v1.Health/Watch");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields["kind"], "server_stream");
    assert_eq!(records[0].code(), "Unimplemented");

    server.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn builtin_health_conflicts_with_a_registered_one() {
    let mut registry = GrpcRegistry::new();
    registry.register_named(HealthServer::new(HealthService::new(Arc::new(AlwaysHealthy))));

    let err = GrpcServerBuilder::new(registry, in_memory())
        .healthcheck(Arc::new(AlwaysHealthy))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration { identity } if identity == "grpc.health.v1.Health"));
}

struct SlowReadiness;

impl HealthChecker for SlowReadiness {
    fn check(&self, kind: ProbeKind) -> BoxFuture<'_, CheckResult> {
        Box::pin(async move {
            if kind == ProbeKind::Readiness {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            CheckResult::healthy()
        })
    }
}

#[tokio::test]
async fn network_stop_drains_in_flight_calls_and_forbids_restart() {
    let server = GrpcServerBuilder::new(GrpcRegistry::new(), local())
        .healthcheck(Arc::new(SlowReadiness))
        .build()
        .unwrap();
    server.start().await.unwrap();
    assert!(server.local_addr().is_some());
    assert_eq!(server.info().listener, ListenerKind::Network);

    let mut client = network_client(&server).await;
    let in_flight = tokio::spawn(async move { probe(&mut client, "readiness").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(
        in_flight.await.unwrap().unwrap(),
        ServingStatus::Serving as i32
    );

    let err = server.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: ServerState::Stopped,
            to: ServerState::Serving
        }
    ));
}

#[tokio::test]
async fn bind_failure_leaves_the_server_not_started() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let server = GrpcServerBuilder::new(GrpcRegistry::new(), ListenerMode::Network { addr })
        .build()
        .unwrap();
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert_eq!(server.state(), ServerState::NotStarted);
}
