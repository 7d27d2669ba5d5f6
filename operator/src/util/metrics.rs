//! Per-controller Prometheus metrics, gated behind the `metrics` feature.
//! Registered once globally via `lazy_static` so `plans::reconcile::run` and
//! `exceptions::reconcile::run` can each hold a `ControllerMetrics` without
//! double-registering the same metric names.

use lazy_static::lazy_static;
use prometheus::{
    HistogramTimer, HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec,
};

lazy_static! {
    static ref RECONCILE_COUNTER: IntCounterVec = register_int_counter_vec!(
        "hibernator_reconcile_total",
        "Total reconciles processed, per controller and object",
        &["controller", "namespace", "name"]
    )
    .unwrap();
    static ref ACTION_COUNTER: IntCounterVec = register_int_counter_vec!(
        "hibernator_action_total",
        "Total reconcile actions taken, by kind",
        &["controller", "action"]
    )
    .unwrap();
    static ref READ_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "hibernator_read_duration_seconds",
        "Time spent reading current object state during a reconcile",
        &["controller"]
    )
    .unwrap();
    static ref WRITE_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "hibernator_write_duration_seconds",
        "Time spent writing status updates during a reconcile",
        &["controller"]
    )
    .unwrap();
}

#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self { controller }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str) {
        RECONCILE_COUNTER
            .with_label_values(&[self.controller, namespace, name])
            .inc();
    }

    pub fn record_action(&self, action: &str) {
        ACTION_COUNTER
            .with_label_values(&[self.controller, action])
            .inc();
    }

    pub fn time_read(&self) -> HistogramTimer {
        READ_HISTOGRAM.with_label_values(&[self.controller]).start_timer()
    }

    pub fn time_write(&self) -> HistogramTimer {
        WRITE_HISTOGRAM.with_label_values(&[self.controller]).start_timer()
    }
}

/// Serves the registry these counters live in. `hibernator_common::metrics`
/// exposes a different, `metrics`-crate-backed registry used by the HTTP
/// services elsewhere in this workspace, so the `prometheus`-crate counters
/// above need their own small exporter rather than reusing that one.
pub async fn run_metrics_server(port: u16) {
    use axum::{Router, routing::get};
    use owo_colors::OwoColorize;
    use prometheus::{Encoder, TextEncoder};

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(|| async {
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                TextEncoder::new().encode(&metric_families, &mut buffer).ok();
                String::from_utf8(buffer).unwrap_or_default()
            }),
        );

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {addr}: {e}");
            return;
        }
    };
    println!("{}", format!("📈 Metrics server listening on {addr}").green());
    axum::serve(listener, app)
        .with_graceful_shutdown(hibernator_common::shutdown::shutdown_signal())
        .await
        .ok();
}

pub fn maybe_spawn_metrics_server() {
    let Ok(port) = std::env::var("METRICS_PORT").unwrap_or_default().parse::<u16>() else {
        return;
    };
    tokio::spawn(run_metrics_server(port));
}
