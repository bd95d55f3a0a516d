//! Prometheus metrics for the Hydra proxy
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;

use crate::protocol::Command;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Hydra metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,
    /// Client authentication failures
    pub auth_failures_total: IntCounter,

    // Session command metrics
    /// Session-modifying commands journaled
    pub session_commands_total: IntCounter,
    /// Commands replayed to late-attaching backends
    pub command_replays_total: IntCounter,
    /// Sessions poisoned by divergent backend replies
    pub reply_divergence_total: IntCounter,

    // Backend metrics
    /// Backends currently attached across all sessions
    pub backends_attached: IntGauge,

    // Query metrics
    /// Queries routed, by command type
    pub queries_total: IntCounterVec,
    /// Query latency histogram (in seconds)
    pub query_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hydra_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "hydra_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "hydra_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let auth_failures_total = IntCounter::new(
            "hydra_auth_failures_total",
            "Total number of failed client authentications",
        )
        .unwrap();

        let session_commands_total = IntCounter::new(
            "hydra_session_commands_total",
            "Total number of session-modifying commands journaled",
        )
        .unwrap();

        let command_replays_total = IntCounter::new(
            "hydra_command_replays_total",
            "Total number of commands replayed to late-attaching backends",
        )
        .unwrap();

        let reply_divergence_total = IntCounter::new(
            "hydra_reply_divergence_total",
            "Total number of sessions poisoned by divergent backend replies",
        )
        .unwrap();

        let backends_attached = IntGauge::new(
            "hydra_backends_attached",
            "Backends currently attached across all sessions",
        )
        .unwrap();

        let queries_total = IntCounterVec::new(
            Opts::new("hydra_queries_total", "Total number of queries routed"),
            &["type"],
        )
        .unwrap();

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new("hydra_query_duration_seconds", "Query latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                    5.0, 10.0,
                ]),
            &["type"],
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(session_commands_total.clone()))
            .unwrap();
        registry
            .register(Box::new(command_replays_total.clone()))
            .unwrap();
        registry
            .register(Box::new(reply_divergence_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backends_attached.clone()))
            .unwrap();
        registry.register(Box::new(queries_total.clone())).unwrap();
        registry
            .register(Box::new(query_duration_seconds.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            auth_failures_total,
            session_commands_total,
            command_replays_total,
            reply_divergence_total,
            backends_attached,
            queries_total,
            query_duration_seconds,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record a failed client authentication
    pub fn record_auth_failure(&self) {
        self.auth_failures_total.inc();
    }

    /// Record a journaled session command
    pub fn record_session_command(&self) {
        self.session_commands_total.inc();
    }

    /// Record one command replayed to a catching-up backend
    pub fn record_command_replay(&self) {
        self.command_replays_total.inc();
    }

    /// Record a poisoned session
    pub fn record_divergence(&self) {
        self.reply_divergence_total.inc();
    }

    /// Record a backend joining the live pool
    pub fn record_backend_attached(&self) {
        self.backends_attached.inc();
    }

    /// Record a backend leaving the live pool
    pub fn record_backend_detached(&self) {
        self.backends_attached.dec();
    }

    /// Record a routed query
    pub fn record_query(&self, opcode: u8, duration_secs: f64) {
        let label = opcode_label(opcode);
        self.queries_total.with_label_values(&[label]).inc();
        self.query_duration_seconds
            .with_label_values(&[label])
            .observe(duration_secs);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn opcode_label(opcode: u8) -> &'static str {
    match Command::from(opcode) {
        Command::Query => "query",
        Command::Ping => "ping",
        Command::FieldList => "field_list",
        Command::StmtExecute => "stmt_execute",
        Command::StmtFetch => "stmt_fetch",
        Command::StmtClose => "stmt_close",
        Command::StmtReset => "stmt_reset",
        Command::Statistics => "statistics",
        Command::ResetConnection => "reset_connection",
        _ => "other",
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
