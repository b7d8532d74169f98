use axum::Json;
use axum::extract::Path;
use axum::response::{IntoResponse, Response};
use clap::Parser;
use ferrule_server::server::config::{CliArgs, ServerConfig};
use ferrule_server::server::health::AlwaysHealthy;
use ferrule_server::server::interceptor::MetricsRegistry;
use ferrule_server::server::registry::{GrpcRegistry, HandlerGroup, HandlerRoute, HttpRegistry};
use ferrule_server::server::telemetry::init_telemetry;
use ferrule_server::server::{GrpcServer, GrpcServerBuilder, HttpServer, HttpServerBuilder};
use http::{Method, StatusCode, header};
use std::sync::Arc;
use tokio::signal;

// Both servers allocate per call from many worker threads.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; flags and the environment still apply.
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config.app.name)?;
    let metrics = providers.metrics_registry();

    let grpc = if config.grpc.enabled {
        Some(build_grpc(&config, &metrics)?)
    } else {
        None
    };
    let http = if config.http.enabled {
        Some(build_http(&config, &metrics)?)
    } else {
        None
    };

    if cfg!(debug_assertions) {
        tracing::info!(app = %config.app.name, env = %config.app.env, "starting with config: {config:#?}");
    } else {
        tracing::info!(app = %config.app.name, env = %config.app.env, "starting");
    }

    // A failed bind is logged by the lifecycle and leaves that server idle.
    if let Some(server) = &grpc {
        if server.start().await.is_ok() {
            tracing::info!(info = %server.info().to_json(), "grpc server started");
        }
    }
    if let Some(server) = &http {
        if server.start().await.is_ok() {
            tracing::info!(info = %server.info().to_json(), "http server started");
        }
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    let deadline = config.shutdown_timeout;
    let (grpc_stopped, http_stopped) = tokio::join!(
        async {
            match &grpc {
                Some(server) => server.stop(deadline).await,
                None => Ok(()),
            }
        },
        async {
            match &http {
                Some(server) => server.stop(deadline).await,
                None => Ok(()),
            }
        },
    );
    if let Err(e) = grpc_stopped {
        tracing::error!(error = %e, "grpc server shutdown");
    }
    if let Err(e) = http_stopped {
        tracing::error!(error = %e, "http server shutdown");
    }

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    Ok(())
}

fn build_grpc(config: &ServerConfig, metrics: &MetricsRegistry) -> anyhow::Result<GrpcServer> {
    let mut builder =
        GrpcServerBuilder::from_config(GrpcRegistry::new(), &config.app, &config.grpc, metrics);
    if config.grpc.healthcheck {
        builder = builder.healthcheck(Arc::new(AlwaysHealthy));
    }
    Ok(builder.build()?)
}

fn build_http(config: &ServerConfig, metrics: &Arc<MetricsRegistry>) -> anyhow::Result<HttpServer> {
    let scraped = Arc::clone(metrics);
    let mut registry = HttpRegistry::new();
    registry
        .register_handler(HandlerRoute::new(Method::GET, "/metrics", move || {
            scrape(Arc::clone(&scraped))
        }))
        .register_handler(HandlerRoute::new(Method::GET, "/ping", ping))
        .register_group(
            HandlerGroup::new("/api/v1")
                .handler(HandlerRoute::new(Method::GET, "/echo/{name}", echo)),
        );
    Ok(HttpServerBuilder::from_config(registry, &config.app, &config.http, metrics).build()?)
}

async fn scrape(metrics: Arc<MetricsRegistry>) -> Response {
    match metrics.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn echo(Path(name): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": name }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
