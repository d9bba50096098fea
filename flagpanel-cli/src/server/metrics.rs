use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use super::state::AppState;

/// Global metrics registry
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// All application metrics
pub struct Metrics {
    // Document contents as of the last listing or write
    pub flags_total: IntGauge,
    pub maintenance_mode: IntGauge,

    // Mutations
    pub flag_writes_total: IntCounterVec,
    pub flag_write_duration: HistogramVec,

    // Auth
    pub sign_ins_total: IntCounterVec,

    // Storage
    pub storage_backend: IntGaugeVec,

    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new(registry: &Registry) -> Self {
        let flags_total = IntGauge::new("fp_flags_total", "Number of flags in the document")
            .expect("failed to create flags_total metric");

        let maintenance_mode = IntGauge::new(
            "fp_maintenance_mode",
            "Maintenance mode as last seen (1=on)",
        )
        .expect("failed to create maintenance_mode metric");

        let flag_writes_total = IntCounterVec::new(
            Opts::new("fp_flag_writes_total", "Total number of flag mutations"),
            &["operation", "status"],
        )
        .expect("failed to create flag_writes_total metric");

        let flag_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "fp_flag_write_duration_seconds",
                "Duration of read-modify-write cycles",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["operation"],
        )
        .expect("failed to create flag_write_duration metric");

        let sign_ins_total = IntCounterVec::new(
            Opts::new("fp_sign_ins_total", "Total number of operator sign-in attempts"),
            &["status"],
        )
        .expect("failed to create sign_ins_total metric");

        let storage_backend = IntGaugeVec::new(
            Opts::new("fp_storage_backend", "Storage backend type (1=active)"),
            &["type"],
        )
        .expect("failed to create storage_backend metric");

        let http_requests_total = IntCounterVec::new(
            Opts::new("fp_http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("failed to create http_requests_total metric");

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "fp_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["method", "path"],
        )
        .expect("failed to create http_request_duration metric");

        registry.register(Box::new(flags_total.clone())).expect("register flags_total");
        registry
            .register(Box::new(maintenance_mode.clone()))
            .expect("register maintenance_mode");
        registry
            .register(Box::new(flag_writes_total.clone()))
            .expect("register flag_writes_total");
        registry
            .register(Box::new(flag_write_duration.clone()))
            .expect("register flag_write_duration");
        registry
            .register(Box::new(sign_ins_total.clone()))
            .expect("register sign_ins_total");
        registry
            .register(Box::new(storage_backend.clone()))
            .expect("register storage_backend");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration.clone()))
            .expect("register http_request_duration");

        Self {
            flags_total,
            maintenance_mode,
            flag_writes_total,
            flag_write_duration,
            sign_ins_total,
            storage_backend,
            http_requests_total,
            http_request_duration,
        }
    }

    /// Record the outcome of one mutation.
    pub fn record_write(&self, operation: &str, ok: bool, started: Instant) {
        let status = if ok { "ok" } else { "error" };
        self.flag_writes_total
            .with_label_values(&[operation, status])
            .inc();
        self.flag_write_duration
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Get the global metrics instance, initializing on first call
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = REGISTRY.get_or_init(Registry::new);
        Metrics::new(registry)
    })
}

/// Axum handler for GET /metrics. Prometheus text format.
pub async fn handle_metrics() -> Response {
    let _ = metrics();
    let registry = REGISTRY.get_or_init(Registry::new);
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "encoding metrics failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Axum handler for GET /readyz: ready once the document store answers reads.
pub async fn handle_readyz(State(state): State<Arc<AppState>>) -> Response {
    let backend = state.repository.store().backend_name();
    match state.repository.check_storage().await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "ready": true,
                "backend": backend,
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(backend, error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(serde_json::json!({
                    "ready": false,
                    "backend": backend,
                    "reason": "storage unavailable",
                })),
            )
                .into_response()
        }
    }
}

/// Axum middleware that records HTTP request count and duration.
pub async fn track_metrics(request: Request<axum::body::Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let m = metrics();
    m.http_requests_total
        .with_label_values(&[&method, &path, &status])
        .inc();
    m.http_request_duration
        .with_label_values(&[&method, &path])
        .observe(elapsed);

    response
}

/// Axum handler for GET /health. Always 200; includes document metadata
/// when the backend tracks it.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let store = state.repository.store();
    let meta = store.get_meta().await;
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "ok",
            "backend": store.backend_name(),
            "document": meta,
        })),
    )
        .into_response()
}
