mod common;

use axum::Json;
use axum::body::Body;
use axum::extract::Path;
use bytes::Bytes;
use common::CallLogs;
use ferrule_core::Error;
use ferrule_core::exclusion::ExclusionRules;
use ferrule_core::state::ServerState;
use ferrule_server::server::factory::HttpServerOptions;
use ferrule_server::server::interceptor::{LoggingSettings, REQUEST_ID_HEADER};
use ferrule_server::server::listener::{InMemoryListener, ListenerKind, ListenerMode};
use ferrule_server::server::registry::{HandlerGroup, HandlerRoute, HttpRegistry};
use ferrule_server::server::{HttpServer, HttpServerBuilder};
use http::{Method, Request, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::ServiceExt;

async fn ping() -> &'static str {
    "pong"
}

async fn echo(Path(name): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": name }))
}

async fn flaky() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn explode() -> &'static str {
    panic!("kaboom")
}

fn registry() -> HttpRegistry {
    let mut registry = HttpRegistry::new();
    registry
        .register_group(
            HandlerGroup::new("/api/v1")
                .handler(HandlerRoute::new(Method::GET, "/echo/{name}", echo)),
        )
        .register_handler(HandlerRoute::new(Method::GET, "/ping", ping))
        .register_handler(HandlerRoute::new(Method::GET, "/flaky", flaky))
        .register_handler(HandlerRoute::new(Method::POST, "/explode", explode));
    registry
}

fn in_memory() -> ListenerMode {
    ListenerMode::InMemory(InMemoryListener::default())
}

async fn call(server: &HttpServer, request: Request<Body>) -> (StatusCode, http::HeaderMap, Bytes) {
    let response = server.router().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// One request over an http1 connection on `io`.
async fn fetch<IO>(io: IO, path: &str) -> (StatusCode, String)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(connection);

    let request = Request::builder()
        .uri(path)
        .header(header::HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn routes_are_served_in_process() {
    let server = HttpServerBuilder::new(registry(), in_memory()).build().unwrap();

    let (status, headers, body) = call(&server, get("/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"pong");
    assert!(!headers[REQUEST_ID_HEADER].is_empty());

    let (status, _, body) = call(&server, get("/api/v1/echo/ferrule")).await;
    assert_eq!(status, StatusCode::OK);
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["name"], "ferrule");

    assert_eq!(
        server.info().endpoints,
        vec![
            "GET /api/v1/echo/{name}".to_owned(),
            "GET /ping".to_owned(),
            "GET /flaky".to_owned(),
            "POST /explode".to_owned(),
        ]
    );
}

#[tokio::test]
async fn request_ids_are_propagated() {
    let server = HttpServerBuilder::new(registry(), in_memory()).build().unwrap();
    let request = Request::builder()
        .uri("/ping")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::empty())
        .unwrap();

    let (_, headers, _) = call(&server, request).await;
    assert_eq!(headers[REQUEST_ID_HEADER], "req-42");
}

#[tokio::test]
async fn unknown_routes_get_a_json_404() {
    let server = HttpServerBuilder::new(registry(), in_memory()).build().unwrap();

    let (status, headers, body) = call(&server, get("/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["message"], "Not Found");
}

#[tokio::test]
async fn panics_become_json_500s() {
    let cases = [
        (true, false, true),
        (true, true, false),
        (false, false, false),
    ];
    for (debug, obfuscate_errors, exposed) in cases {
        let server = HttpServerBuilder::new(registry(), in_memory())
            .options(HttpServerOptions {
                debug,
                obfuscate_errors,
            })
            .build()
            .unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/explode")
            .body(Body::empty())
            .unwrap();

        let (status, _, body) = call(&server, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let message = payload["message"].as_str().unwrap();
        assert_eq!(message.contains("kaboom"), exposed, "{message}");

        let (status, _, _) = call(&server, get("/ping")).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn excluded_prefixes_are_logged_only_on_failure() {
    let logs = CallLogs::default();
    let _guard = logs.set_default();

    let server = HttpServerBuilder::new(registry(), in_memory())
        .logging(
            LoggingSettings::new()
                .exclusions(ExclusionRules::prefixes(["/ping", "/flaky"]))
                .level_from_outcome(true),
        )
        .build()
        .unwrap();

    call(&server, get("/ping")).await;
    assert!(logs.for_method("GET /ping").is_empty());

    let (status, _, _) = call(&server, get("/flaky")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let records = logs.for_method("GET /flaky");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].code(), "503");
    assert_eq!(records[0].level, tracing::Level::ERROR);

    call(&server, get("/api/v1/echo/x")).await;
    let records = logs.for_method("GET /api/v1/echo/{name}");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].level, tracing::Level::INFO);
}

#[tokio::test]
async fn unmatched_paths_share_one_route() {
    let logs = CallLogs::default();
    let _guard = logs.set_default();
    let server = HttpServerBuilder::new(registry(), in_memory()).build().unwrap();

    for path in ["/scan/a1b2", "/scan/zz99", "/wp-admin.php"] {
        let (status, _, _) = call(&server, get(path)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let records = logs.for_method("GET unmatched");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.code() == "404"));
    assert!(logs.for_method("GET /wp-admin.php").is_empty());
}

#[tokio::test]
async fn serves_over_the_in_memory_listener() {
    let server = HttpServerBuilder::new(registry(), in_memory()).build().unwrap();
    server.start().await.unwrap();
    assert_eq!(server.info().listener, ListenerKind::InMemory);

    let stream = server.in_memory_listener().unwrap().dial().unwrap();
    let (status, body) = fetch(stream, "/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");

    server.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn serves_over_tcp_until_stopped() {
    let mode = ListenerMode::Network {
        addr: "127.0.0.1:0".parse().unwrap(),
    };
    let server = HttpServerBuilder::new(registry(), mode).build().unwrap();
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    assert_eq!(
        server.info().address.as_deref(),
        Some(addr.to_string().as_str())
    );

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (status, body) = fetch(stream, "/api/v1/echo/net").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"name":"net"}"#);

    server.stop(Duration::from_secs(5)).await.unwrap();
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert!(matches!(
        server.start().await.unwrap_err(),
        Error::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn invalid_registrations_fail_the_build() {
    let mut registry = HttpRegistry::new();
    registry
        .register_handler(HandlerRoute::new(Method::GET, "/ping", ping))
        .register_handler(HandlerRoute::new(Method::GET, "/ping", ping));
    let err = HttpServerBuilder::new(registry, in_memory())
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRegistration { identity } if identity == "GET /ping"));

    let mut registry = HttpRegistry::new();
    registry
        .register_handler(HandlerRoute::new(Method::GET, "/users/{id}", ping))
        .register_handler(HandlerRoute::new(Method::GET, "/users/{name}", ping));
    let err = HttpServerBuilder::new(registry, in_memory())
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRoute { path, .. } if path == "/users/{name}"));

    let mut registry = HttpRegistry::new();
    registry.register_handler(HandlerRoute::new(Method::GET, "/users/:id", ping));
    let err = HttpServerBuilder::new(registry, in_memory())
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRoute { path, .. } if path == "/users/:id"));
}
