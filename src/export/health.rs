use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "devbench";

/// Prometheus metrics for harness health.
///
/// All metrics use the "devbench" namespace.
pub struct HarnessMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Log stream ===
    /// Raw log lines received by the dispatcher.
    pub lines_received: Counter,
    /// Lines skipped because the dispatcher fell behind the stream.
    pub lines_lagged: Counter,
    /// Typed entries emitted by kind.
    pub entries_emitted: CounterVec,
    /// Extraction failures by parser.
    pub parse_errors: CounterVec,
    /// Lines that arrived after the dispatcher was stopped or restarted.
    pub late_lines_dropped: Counter,

    // === Trials ===
    /// Trial attempts started, including retries.
    pub trial_attempts: Counter,
    /// Trial attempts that hit the timeout.
    pub trial_timeouts: Counter,
    /// Trials formatted and reported.
    pub trials_completed: Counter,
    /// Wall-clock duration of successful trials (1s-300s buckets).
    pub trial_duration: Histogram,

    // === Reporting ===
    /// Points written by sink.
    pub points_reported: CounterVec,
    /// Report failures by sink.
    pub report_errors: CounterVec,
}

impl HarnessMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let lines_received = Counter::with_opts(
            Opts::new("log_lines_received_total", "Raw log lines received.").namespace(NAMESPACE),
        )?;
        let lines_lagged = Counter::with_opts(
            Opts::new(
                "log_lines_lagged_total",
                "Log lines skipped because the dispatcher fell behind.",
            )
            .namespace(NAMESPACE),
        )?;
        let entries_emitted = CounterVec::new(
            Opts::new("entries_emitted_total", "Typed entries emitted by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let parse_errors = CounterVec::new(
            Opts::new("parse_errors_total", "Entry extraction failures by parser.")
                .namespace(NAMESPACE),
            &["parser"],
        )?;
        let late_lines_dropped = Counter::with_opts(
            Opts::new(
                "late_lines_dropped_total",
                "Lines dropped after a dispatcher stop or restart.",
            )
            .namespace(NAMESPACE),
        )?;

        let trial_attempts = Counter::with_opts(
            Opts::new(
                "trial_attempts_total",
                "Trial attempts started, including retries.",
            )
            .namespace(NAMESPACE),
        )?;
        let trial_timeouts = Counter::with_opts(
            Opts::new("trial_timeouts_total", "Trial attempts that timed out.")
                .namespace(NAMESPACE),
        )?;
        let trials_completed = Counter::with_opts(
            Opts::new("trials_completed_total", "Trials formatted and reported.")
                .namespace(NAMESPACE),
        )?;
        let trial_duration = Histogram::with_opts(
            HistogramOpts::new(
                "trial_duration_seconds",
                "Wall-clock duration of successful trials.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        let points_reported = CounterVec::new(
            Opts::new("points_reported_total", "Points written by sink.").namespace(NAMESPACE),
            &["sink"],
        )?;
        let report_errors = CounterVec::new(
            Opts::new("report_errors_total", "Report failures by sink.").namespace(NAMESPACE),
            &["sink"],
        )?;

        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(lines_lagged.clone()))?;
        registry.register(Box::new(entries_emitted.clone()))?;
        registry.register(Box::new(parse_errors.clone()))?;
        registry.register(Box::new(late_lines_dropped.clone()))?;
        registry.register(Box::new(trial_attempts.clone()))?;
        registry.register(Box::new(trial_timeouts.clone()))?;
        registry.register(Box::new(trials_completed.clone()))?;
        registry.register(Box::new(trial_duration.clone()))?;
        registry.register(Box::new(points_reported.clone()))?;
        registry.register(Box::new(report_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_received,
            lines_lagged,
            entries_emitted,
            parse_errors,
            late_lines_dropped,
            trial_attempts,
            trial_timeouts,
            trials_completed,
            trial_duration,
            points_reported,
            report_errors,
        })
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Does nothing when no listen address is configured.
    pub async fn start(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
