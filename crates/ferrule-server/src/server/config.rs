use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Runtime configuration for the `ferrule-server` binary.
///
/// Every option can be given on the command line or through the matching
/// environment variable, which may also come from a `.env` file. List
/// options take comma separated values.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ferrule-server",
    version,
    about = "gRPC and HTTP servers wrapped in recovery, tracing, logging and metrics"
)]
pub struct CliArgs {
    /// Application name, used as the default metrics namespace.
    ///
    /// Environment variable: `APP_NAME`
    #[arg(long, env = "APP_NAME", default_value_t = String::from("ferrule"))]
    pub app_name: String,

    /// Application environment. `test` switches both servers to in-memory
    /// listeners.
    ///
    /// Environment variable: `APP_ENV`
    #[arg(long, env = "APP_ENV", default_value_t = String::from("dev"))]
    pub app_env: String,

    /// Exposes fault details in recovered error responses.
    ///
    /// Environment variable: `APP_DEBUG`
    #[arg(long, env = "APP_DEBUG", default_value_t = false)]
    pub app_debug: bool,

    /// Interface both servers bind to.
    ///
    /// Environment variable: `SERVER_HOST`
    #[arg(long, env = "SERVER_HOST", default_value_t = IpAddr::from([0, 0, 0, 0]))]
    pub host: IpAddr,

    /// Upper bound for draining in-flight calls on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Environment variable: `GRPC_SERVER_ENABLED`
    #[arg(long, env = "GRPC_SERVER_ENABLED", action = ArgAction::Set, default_value_t = true)]
    pub grpc_enabled: bool,

    /// Environment variable: `GRPC_SERVER_PORT`
    #[arg(long, env = "GRPC_SERVER_PORT", default_value_t = 50051)]
    pub grpc_port: u16,

    /// Per-direction buffer of in-memory connections, in bytes. `0` uses
    /// the default of 1 MiB.
    ///
    /// Environment variable: `GRPC_SERVER_TEST_BUFFER_SIZE`
    #[arg(long, env = "GRPC_SERVER_TEST_BUFFER_SIZE", default_value_t = 0)]
    pub grpc_test_buffer_size: usize,

    /// Environment variable: `GRPC_SERVER_REFLECTION_ENABLED`
    #[arg(long, env = "GRPC_SERVER_REFLECTION_ENABLED", default_value_t = false)]
    pub grpc_reflection: bool,

    /// Environment variable: `GRPC_SERVER_HEALTHCHECK_ENABLED`
    #[arg(long, env = "GRPC_SERVER_HEALTHCHECK_ENABLED", default_value_t = false)]
    pub grpc_healthcheck: bool,

    /// Environment variable: `GRPC_SERVER_TRACE_ENABLED`
    #[arg(long, env = "GRPC_SERVER_TRACE_ENABLED", default_value_t = false)]
    pub grpc_trace: bool,

    /// Full method names (`/package.Service/Method`) served without spans.
    ///
    /// Environment variable: `GRPC_SERVER_TRACE_EXCLUDE`
    #[arg(long, env = "GRPC_SERVER_TRACE_EXCLUDE", value_delimiter = ',')]
    pub grpc_trace_exclude: Vec<String>,

    /// Request metadata copied into call records, as `key=field` pairs.
    ///
    /// Environment variable: `GRPC_SERVER_LOG_METADATA`
    #[arg(long, env = "GRPC_SERVER_LOG_METADATA", value_delimiter = ',')]
    pub grpc_log_metadata: Vec<String>,

    /// Full method names not logged when they succeed.
    ///
    /// Environment variable: `GRPC_SERVER_LOG_EXCLUDE`
    #[arg(long, env = "GRPC_SERVER_LOG_EXCLUDE", value_delimiter = ',')]
    pub grpc_log_exclude: Vec<String>,

    /// Environment variable: `GRPC_SERVER_METRICS_ENABLED`
    #[arg(long, env = "GRPC_SERVER_METRICS_ENABLED", default_value_t = false)]
    pub grpc_metrics: bool,

    /// Defaults to the application name.
    ///
    /// Environment variable: `GRPC_SERVER_METRICS_NAMESPACE`
    #[arg(long, env = "GRPC_SERVER_METRICS_NAMESPACE")]
    pub grpc_metrics_namespace: Option<String>,

    /// Environment variable: `GRPC_SERVER_METRICS_SUBSYSTEM`
    #[arg(long, env = "GRPC_SERVER_METRICS_SUBSYSTEM", default_value_t = String::from("grpcserver"))]
    pub grpc_metrics_subsystem: String,

    /// Histogram boundaries in seconds, e.g. `0.01,0.1,1`.
    ///
    /// Environment variable: `GRPC_SERVER_METRICS_BUCKETS`
    #[arg(long, env = "GRPC_SERVER_METRICS_BUCKETS", default_value_t = String::new())]
    pub grpc_metrics_buckets: String,

    /// Environment variable: `HTTP_SERVER_ENABLED`
    #[arg(long, env = "HTTP_SERVER_ENABLED", action = ArgAction::Set, default_value_t = true)]
    pub http_enabled: bool,

    /// Environment variable: `HTTP_SERVER_PORT`
    #[arg(long, env = "HTTP_SERVER_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Environment variable: `HTTP_SERVER_TEST_BUFFER_SIZE`
    #[arg(long, env = "HTTP_SERVER_TEST_BUFFER_SIZE", default_value_t = 0)]
    pub http_test_buffer_size: usize,

    /// Environment variable: `HTTP_SERVER_TRACE_ENABLED`
    #[arg(long, env = "HTTP_SERVER_TRACE_ENABLED", default_value_t = false)]
    pub http_trace: bool,

    /// URI prefixes served without spans.
    ///
    /// Environment variable: `HTTP_SERVER_TRACE_EXCLUDE`
    #[arg(long, env = "HTTP_SERVER_TRACE_EXCLUDE", value_delimiter = ',')]
    pub http_trace_exclude: Vec<String>,

    /// Request headers copied into call records, as `header=field` pairs.
    ///
    /// Environment variable: `HTTP_SERVER_LOG_HEADERS`
    #[arg(long, env = "HTTP_SERVER_LOG_HEADERS", value_delimiter = ',')]
    pub http_log_headers: Vec<String>,

    /// URI prefixes not logged when they succeed.
    ///
    /// Environment variable: `HTTP_SERVER_LOG_EXCLUDE`
    #[arg(long, env = "HTTP_SERVER_LOG_EXCLUDE", value_delimiter = ',')]
    pub http_log_exclude: Vec<String>,

    /// Derive the record level from the response status.
    ///
    /// Environment variable: `HTTP_SERVER_LOG_LEVEL_FROM_RESPONSE`
    #[arg(long, env = "HTTP_SERVER_LOG_LEVEL_FROM_RESPONSE", action = ArgAction::Set, default_value_t = true)]
    pub http_log_level_from_response: bool,

    /// Environment variable: `HTTP_SERVER_METRICS_ENABLED`
    #[arg(long, env = "HTTP_SERVER_METRICS_ENABLED", default_value_t = false)]
    pub http_metrics: bool,

    /// Environment variable: `HTTP_SERVER_METRICS_NAMESPACE`
    #[arg(long, env = "HTTP_SERVER_METRICS_NAMESPACE")]
    pub http_metrics_namespace: Option<String>,

    /// Environment variable: `HTTP_SERVER_METRICS_SUBSYSTEM`
    #[arg(long, env = "HTTP_SERVER_METRICS_SUBSYSTEM", default_value_t = String::from("httpserver"))]
    pub http_metrics_subsystem: String,

    /// Environment variable: `HTTP_SERVER_METRICS_BUCKETS`
    #[arg(long, env = "HTTP_SERVER_METRICS_BUCKETS", default_value_t = String::new())]
    pub http_metrics_buckets: String,

    /// Report `2xx`, `4xx`... instead of exact status codes.
    ///
    /// Environment variable: `HTTP_SERVER_METRICS_NORMALIZE`
    #[arg(long, env = "HTTP_SERVER_METRICS_NORMALIZE", default_value_t = false)]
    pub http_metrics_normalize: bool,

    /// Never return error details, even in debug mode.
    ///
    /// Environment variable: `HTTP_SERVER_ERRORS_OBFUSCATE`
    #[arg(long, env = "HTTP_SERVER_ERRORS_OBFUSCATE", default_value_t = false)]
    pub http_errors_obfuscate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub name: String,
    pub env: String,
    pub debug: bool,
}

impl AppConfig {
    pub fn is_test(&self) -> bool {
        self.env.eq_ignore_ascii_case("test")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
    pub subsystem: String,
    pub buckets: String,
    pub normalize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Metadata key (or header) → record field.
    pub fields: Vec<(String, String)>,
    pub exclude: Vec<String>,
    pub level_from_response: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrpcConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
    pub test_buffer_size: usize,
    pub reflection: bool,
    pub healthcheck: bool,
    pub trace: TraceConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
    pub test_buffer_size: usize,
    pub trace: TraceConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
    pub obfuscate_errors: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub app: AppConfig,
    pub grpc: GrpcConfig,
    pub http: HttpConfig,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.app_name.trim().is_empty() {
            bail!("APP_NAME must not be empty");
        }
        if args.shutdown_timeout_secs == 0 {
            bail!("SHUTDOWN_TIMEOUT_SECS must be greater than 0");
        }
        if args.grpc_enabled
            && args.http_enabled
            && args.grpc_port != 0
            && args.grpc_port == args.http_port
        {
            bail!(
                "GRPC_SERVER_PORT and HTTP_SERVER_PORT are both {}",
                args.grpc_port
            );
        }

        let grpc_fields = parse_field_map(&args.grpc_log_metadata)
            .context("invalid GRPC_SERVER_LOG_METADATA")?;
        let http_fields =
            parse_field_map(&args.http_log_headers).context("invalid HTTP_SERVER_LOG_HEADERS")?;

        let namespace = |ns: Option<String>| {
            ns.filter(|ns| !ns.trim().is_empty())
                .unwrap_or_else(|| args.app_name.clone())
        };

        Ok(Self {
            grpc: GrpcConfig {
                enabled: args.grpc_enabled,
                addr: SocketAddr::new(args.host, args.grpc_port),
                test_buffer_size: args.grpc_test_buffer_size,
                reflection: args.grpc_reflection,
                healthcheck: args.grpc_healthcheck,
                trace: TraceConfig {
                    enabled: args.grpc_trace,
                    exclude: non_empty(args.grpc_trace_exclude),
                },
                log: LogConfig {
                    fields: grpc_fields,
                    exclude: non_empty(args.grpc_log_exclude),
                    level_from_response: true,
                },
                metrics: MetricsConfig {
                    enabled: args.grpc_metrics,
                    namespace: namespace(args.grpc_metrics_namespace),
                    subsystem: args.grpc_metrics_subsystem,
                    buckets: args.grpc_metrics_buckets,
                    normalize: false,
                },
            },
            http: HttpConfig {
                enabled: args.http_enabled,
                addr: SocketAddr::new(args.host, args.http_port),
                test_buffer_size: args.http_test_buffer_size,
                trace: TraceConfig {
                    enabled: args.http_trace,
                    exclude: non_empty(args.http_trace_exclude),
                },
                log: LogConfig {
                    fields: http_fields,
                    exclude: non_empty(args.http_log_exclude),
                    level_from_response: args.http_log_level_from_response,
                },
                metrics: MetricsConfig {
                    enabled: args.http_metrics,
                    namespace: namespace(args.http_metrics_namespace),
                    subsystem: args.http_metrics_subsystem,
                    buckets: args.http_metrics_buckets,
                    normalize: args.http_metrics_normalize,
                },
                obfuscate_errors: args.http_errors_obfuscate,
            },
            app: AppConfig {
                name: args.app_name,
                env: args.app_env,
                debug: args.app_debug,
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Parses `key=field` pairs. A bare `key` maps to a field of the same name.
fn parse_field_map(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    non_empty(pairs.to_vec())
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, field)) => {
                let (key, field) = (key.trim(), field.trim());
                if key.is_empty() || field.is_empty() {
                    bail!("`{pair}` is not a key=field pair");
                }
                Ok((key.to_owned(), field.to_owned()))
            }
            None => Ok((pair.clone(), pair)),
        })
        .collect()
}
