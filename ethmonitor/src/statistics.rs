//! Prometheus metrics, following the same `once_cell::Lazy` +
//! `register_*!` pattern as `block-watcher`'s `statistics.rs`, renamed to
//! the `ethmonitor_` prefix.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, linear_buckets, register_gauge_vec, register_histogram,
    register_int_counter, register_int_gauge, GaugeVec, Histogram, IntCounter, IntGauge,
};

pub static BLOCKS_ADDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ethmonitor_blocks_added",
        "Count of blocks classified as Added across all monitor iterations."
    )
    .unwrap()
});

pub static BLOCKS_REMOVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ethmonitor_blocks_removed",
        "Count of blocks classified as Removed (i.e. unwound during a reorg)."
    )
    .unwrap()
});

pub static REORG_DEPTH: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "ethmonitor_reorg_depth",
        "Depth (in blocks popped) of detected reorgs.",
        linear_buckets(1.0, 1.0, 20).unwrap()
    )
    .unwrap()
});

pub static BLOCK_HEADER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "ethmonitor_block_header_latency",
        "Latency of block_by_number/block_by_hash RPC calls.",
        exponential_buckets(0.01, 2.0, 16).unwrap()
    )
    .unwrap()
});

pub static LOG_FETCH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ethmonitor_log_fetch_failures",
        "Count of filter_logs calls (initial or backfill) that failed."
    )
    .unwrap()
});

pub static SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ethmonitor_subscribers",
        "Current number of active subscribers."
    )
    .unwrap()
});

pub static SUBSCRIBER_STALLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ethmonitor_subscriber_stalls",
        "Count of strict-mode sends that stalled past the warning threshold."
    )
    .unwrap()
});

pub static SUBSCRIBER_BUFFER_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "ethmonitor_subscriber_buffer_depth",
        "Approximate number of undelivered batches buffered for a subscriber.",
        &["subscriber"]
    )
    .unwrap()
});
