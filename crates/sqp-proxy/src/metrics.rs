//! Prometheus metrics for the speculative proxy
//!
//! Exports metrics for:
//! - Prediction outcomes and speculative dispatches
//! - Rollbacks of mis-predicted writes
//! - Replica health and connection admission
//! - Per-category query latency

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════
// SPECULATION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Real queries by prediction outcome (hit_ready, hit_pending, miss)
pub static PREDICTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sqp_predictions_total",
        "Real queries by prediction outcome",
        &["outcome"]
    )
    .expect("metric can be registered")
});

/// Speculative statements dispatched (read, write)
pub static SPECULATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sqp_speculations_total",
        "Speculative statements dispatched to idle replicas",
        &["kind"]
    )
    .expect("metric can be registered")
});

/// Mis-predicted writes rolled back (undo, savepoint, failed_write)
pub static ROLLBACKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sqp_rollbacks_total",
        "Speculative writes rolled back, by method",
        &["method"]
    )
    .expect("metric can be registered")
});

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Replicas dropped from a session
pub static REPLICA_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sqp_replica_failures_total",
        "Replica connections lost during a session",
        &["replica"]
    )
    .expect("metric can be registered")
});

/// Client connections refused (too_many, blocked, handshake)
pub static REJECTED_CONNECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "sqp_rejected_connections_total",
        "Client connections refused",
        &["reason"]
    )
    .expect("metric can be registered")
});

/// Sessions currently running
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("sqp_active_sessions", "Client sessions currently running")
        .expect("metric can be registered")
});

// ═══════════════════════════════════════════════════════════════════════════
// LATENCY METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Latency by session statistics category
pub static QUERY_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sqp_query_latency_seconds",
        "Query latency by category",
        &["category"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("metric can be registered")
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize all metrics (call at startup)
pub fn init_metrics() {
    let _ = &*PREDICTIONS_TOTAL;
    let _ = &*SPECULATIONS_TOTAL;
    let _ = &*ROLLBACKS_TOTAL;
    let _ = &*REPLICA_FAILURES_TOTAL;
    let _ = &*REJECTED_CONNECTIONS_TOTAL;
    let _ = &*ACTIVE_SESSIONS;
    let _ = &*QUERY_LATENCY_SECONDS;

    for outcome in ["hit_ready", "hit_pending", "miss"] {
        PREDICTIONS_TOTAL.with_label_values(&[outcome]);
    }
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_prediction(outcome: &str) {
    PREDICTIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_speculation(kind: &str) {
    SPECULATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_rollback(method: &str) {
    ROLLBACKS_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_replica_failure(replica: usize) {
    REPLICA_FAILURES_TOTAL
        .with_label_values(&[&replica.to_string()])
        .inc();
}

pub fn record_rejected_connection(reason: &str) {
    REJECTED_CONNECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_latency(category: &str, micros: u64) {
    QUERY_LATENCY_SECONDS
        .with_label_values(&[category])
        .observe(micros as f64 / 1_000_000.0);
}

pub fn session_started() {
    ACTIVE_SESSIONS.inc();
}

pub fn session_ended() {
    ACTIVE_SESSIONS.dec();
}
