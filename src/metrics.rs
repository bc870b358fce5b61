//! Metrics for the selector pipeline
//!
//! Prometheus counters covering selector cache use, storage selects, and
//! operator output. Everything is registered in the default registry and can
//! be exported with [`gather_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Selector Cache ===

    /// Selector pool lookups by result (hit / miss)
    pub static ref SELECTOR_CACHE_REQUESTS: CounterVec = register_counter_vec!(
        "kuba_exec_selector_cache_requests_total",
        "Selector pool lookups",
        &["result"]
    ).expect("register selector cache counter");

    // === Storage ===

    /// Storage select calls by status
    pub static ref STORAGE_SELECTS: CounterVec = register_counter_vec!(
        "kuba_exec_storage_selects_total",
        "Select calls issued to storage",
        &["status"]
    ).expect("register storage select counter");

    /// Storage select duration, including draining the series stream
    pub static ref STORAGE_SELECT_DURATION: HistogramVec = register_histogram_vec!(
        "kuba_exec_storage_select_duration_seconds",
        "Select latency in seconds",
        &["status"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]
    ).expect("register storage select histogram");

    /// Series materialized from storage
    pub static ref SERIES_LOADED: Counter = register_counter!(
        "kuba_exec_series_loaded_total",
        "Series loaded from storage"
    ).expect("register series loaded counter");

    // === Operators ===

    /// Step batches emitted per operator
    pub static ref STEP_BATCHES: CounterVec = register_counter_vec!(
        "kuba_exec_step_batches_total",
        "Step batches emitted",
        &["operator"]
    ).expect("register step batch counter");

    /// Errors raised per operator
    pub static ref OPERATOR_ERRORS: CounterVec = register_counter_vec!(
        "kuba_exec_operator_errors_total",
        "Errors raised by operators",
        &["operator"]
    ).expect("register operator error counter");
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a selector pool lookup
#[inline]
pub fn record_selector_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    SELECTOR_CACHE_REQUESTS.with_label_values(&[result]).inc();
}

/// Record a storage select and how many series it produced
pub fn record_storage_select(duration_secs: f64, series: usize, success: bool) {
    let status = if success { "success" } else { "error" };
    STORAGE_SELECTS.with_label_values(&[status]).inc();
    STORAGE_SELECT_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
    SERIES_LOADED.inc_by(series as f64);
}

/// Record a batch emitted by an operator
#[inline]
pub fn record_step_batch(operator: &str) {
    STEP_BATCHES.with_label_values(&[operator]).inc();
}

/// Record an error raised by an operator
#[inline]
pub fn record_operator_error(operator: &str) {
    OPERATOR_ERRORS.with_label_values(&[operator]).inc();
}
