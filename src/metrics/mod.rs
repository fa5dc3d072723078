//! Metrics module
//!
//! Prometheus metrics for streamed uploads. Metrics live in the default
//! registry; expose them with [`gather`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Stream metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "upload_stream_uploads_total",
        "Total number of closed upload streams",
        &["strategy", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "upload_stream_bytes_total",
        "Total bytes committed by upload streams"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "upload_stream_duration_seconds",
        "Time from stream creation to close",
        &["strategy"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Part metrics
    pub static ref PARTS_TOTAL: CounterVec = register_counter_vec!(
        "upload_stream_parts_total",
        "Total multipart parts uploaded",
        &["status"]
    ).unwrap();

    pub static ref PART_BYTES_TOTAL: Counter = register_counter!(
        "upload_stream_part_bytes_total",
        "Bytes sent in multipart parts"
    ).unwrap();

    pub static ref PART_DURATION: Histogram = register_histogram!(
        "upload_stream_part_duration_seconds",
        "Part upload duration in seconds",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Cleanup metrics
    pub static ref ABORTS_TOTAL: CounterVec = register_counter_vec!(
        "upload_stream_aborts_total",
        "Multipart uploads aborted after a failure",
        &["status"]
    ).unwrap();
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record a closed stream
pub fn record_upload(strategy: &str, success: bool, bytes: u64, duration_secs: f64) {
    UPLOADS_TOTAL
        .with_label_values(&[strategy, status(success)])
        .inc();
    UPLOAD_DURATION
        .with_label_values(&[strategy])
        .observe(duration_secs);
    if success {
        UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    }
}

/// Record one part upload attempt
pub fn record_part_upload(bytes: usize, duration_secs: f64, success: bool) {
    PARTS_TOTAL.with_label_values(&[status(success)]).inc();
    PART_DURATION.observe(duration_secs);
    if success {
        PART_BYTES_TOTAL.inc_by(bytes as f64);
    }
}

/// Record an abort attempt
pub fn record_abort(success: bool) {
    ABORTS_TOTAL.with_label_values(&[status(success)]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
