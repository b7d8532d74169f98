//! # Telemetry
//!
//! Process-wide logging, tracing and metrics providers. The servers only
//! consume what is installed here: spans go through the global tracer
//! provider, call metrics through the shared [`MetricsRegistry`], which is
//! scraped in the OpenMetrics text format.
//!
//! ## Exporters
//!
//! - `stdout`: spans printed by the OpenTelemetry stdout exporter.
//! - `otlp`: spans sent over OTLP/gRPC. The endpoint is read from the
//!   standard `OTEL_EXPORTER_OTLP_ENDPOINT` variable.
//!
//! Without an exporter feature, spans still carry trace ids (used in call
//! records and metric exemplars) but nothing leaves the process.
//!
//! ## Logging
//!
//! Events are always printed by `tracing_subscriber::fmt`, filtered with
//! `RUST_LOG` (default `info`).
//!
//! ```bash
//! cargo run --features stdout
//! RUST_LOG=ferrule::call=debug cargo run --features otlp
//! ```

use crate::server::interceptor::MetricsRegistry;
use opentelemetry::trace::TracerProvider;
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions as semvcns;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;

pub struct TelemetryProviders {
    pub tracer_provider: sdktrace::SdkTracerProvider,
    metrics: Arc<MetricsRegistry>,
}

impl TelemetryProviders {
    /// Registry every server registers its call metrics on.
    pub fn metrics_registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Flushes and shuts down the tracer provider. Failures are printed,
    /// since the subscriber may already be gone.
    pub fn shutdown(&self) {
        if let Err(err) = self.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {err:#?}");
        }
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {err:#?}");
        }
    }
}

pub fn init_telemetry(service_name: &str) -> anyhow::Result<TelemetryProviders> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let tracer_provider = init_tracer(service_name)?;

    let scope = InstrumentationScope::builder("ferrule")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    opentelemetry::global::set_tracer_provider(tracer_provider.clone());

    // Console output is independent of the OpenTelemetry stdout exporter.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope))
                .with_error_records_to_exceptions(true),
        )
        .try_init()?;

    Ok(TelemetryProviders {
        tracer_provider,
        metrics: Arc::new(MetricsRegistry::new()),
    })
}

fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_owned())
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

fn init_tracer(service_name: &str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build span exporter")?;
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}
