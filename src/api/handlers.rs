//! API route handlers
//!
//! - Liveness for process supervisors
//! - Engine status as JSON (counters plus the effective configuration)
//! - Counters in Prometheus text format

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::config::{AggregateWritePolicy, BackpressurePolicy, EngineConfig};
use crate::metrics::{EngineMetrics, MetricsSnapshot};

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub metrics: Arc<EngineMetrics>,
    pub info: Arc<EngineInfo>,
}

impl ApiState {
    pub fn new(metrics: Arc<EngineMetrics>, info: EngineInfo) -> Self {
        Self {
            metrics,
            info: Arc::new(info),
        }
    }
}

/// Static description of the running engine, fixed at startup.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub source: String,
    pub command_transport: String,
    pub storage_backend: String,
    pub partition_count: usize,
    pub backpressure: BackpressurePolicy,
    pub window_size_secs: u64,
    pub window_step_secs: u64,
    pub allowed_lateness_secs: u64,
    pub cooldown_secs: u64,
    pub aggregate_writes: AggregateWritePolicy,
}

impl EngineInfo {
    pub fn from_config(
        config: &EngineConfig,
        source: impl Into<String>,
        command_transport: impl Into<String>,
        storage_backend: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            command_transport: command_transport.into(),
            storage_backend: storage_backend.into(),
            partition_count: config.runtime.partition_count,
            backpressure: config.runtime.backpressure,
            window_size_secs: config.window.size_secs,
            window_step_secs: config.window.step_secs,
            allowed_lateness_secs: config
                .window
                .allowed_lateness_secs
                .unwrap_or(config.window.size_secs),
            cooldown_secs: config.saga.cooldown_secs.unwrap_or(config.window.size_secs),
            aggregate_writes: config.sink.aggregate_writes,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.metrics.snapshot().uptime_secs,
    })
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub engine: EngineInfo,
    pub counters: MetricsSnapshot,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(StatusResponse {
        engine: state.info.as_ref().clone(),
        counters: state.metrics.snapshot(),
    })
}

// ============================================================================
// Prometheus Metrics
// ============================================================================

const METRIC_PREFIX: &str = "reactor_saga";

fn push_metric(body: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(body, "# HELP {METRIC_PREFIX}_{name} {help}");
    let _ = writeln!(body, "# TYPE {METRIC_PREFIX}_{name} {kind}");
    let _ = writeln!(body, "{METRIC_PREFIX}_{name} {value}");
}

/// Render a snapshot in Prometheus text format (version 0.0.4).
pub fn render_prometheus(snap: &MetricsSnapshot) -> String {
    let mut body = String::with_capacity(2048);
    let counters = [
        ("readings_processed_total", "Readings fully processed by a lane", snap.readings_processed),
        ("late_drops_total", "Readings dropped behind the window horizon", snap.late_drops),
        ("violations_total", "Readings outside their nominal band", snap.violations),
        ("commands_emitted_total", "Saga commands handed to the transport", snap.commands_emitted),
        ("commands_suppressed_total", "Violations inside an active cooldown", snap.commands_suppressed),
        ("emission_failures_total", "Failed command emissions", snap.emission_failures),
        ("redeliveries_total", "In-lane redeliveries after an emission failure", snap.redeliveries),
        ("deliveries_abandoned_total", "Deliveries left unacknowledged after all attempts", snap.deliveries_abandoned),
        ("submits_rejected_total", "Deliveries rejected by a full lane queue", snap.submits_rejected),
        ("decode_errors_total", "Malformed inbound lines", snap.decode_errors),
        ("sink_writes_total", "Successful sink writes", snap.sink_writes),
        ("sink_failures_total", "Failed sink writes", snap.sink_failures),
        ("sink_timeouts_total", "Sink writes that exceeded the timeout", snap.sink_timeouts),
    ];
    for (name, help, value) in counters {
        push_metric(&mut body, name, "counter", help, value);
    }
    push_metric(&mut body, "committed_offset", "gauge", "Next offset a restart would consume", snap.committed_offset);
    push_metric(&mut body, "uptime_seconds", "gauge", "Process uptime in seconds", snap.uptime_secs);

    let _ = writeln!(body, "# HELP {METRIC_PREFIX}_lane_processed_total Readings processed per lane");
    let _ = writeln!(body, "# TYPE {METRIC_PREFIX}_lane_processed_total counter");
    for (lane, count) in snap.lane_processed.iter().enumerate() {
        let _ = writeln!(body, "{METRIC_PREFIX}_lane_processed_total{{lane=\"{lane}\"}} {count}");
    }
    body
}

/// GET /api/v1/metrics
pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&state.metrics.snapshot()),
    )
}

pub async fn not_found() -> Response {
    ApiErrorResponse::not_found("no such endpoint")
}
